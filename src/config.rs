//! Engine configuration and filesystem defaults.

use std::path::PathBuf;

use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::StagePools;
use crate::search::DedupConfig;

/// Tunables for one engine instance. `Default` is the production shape;
/// tests shrink the delays.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pools: StagePools,
    pub retry: RetryPolicy,
    pub dedup: DedupConfig,
}

/// Per-user data root holding one directory per review. Falls back to the
/// working directory on platforms without a data dir.
pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("evidra")
}

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default `RUST_LOG`-style filter for the tracing subscriber.
pub fn default_log_filter() -> &'static str {
    "evidra=info"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_root_ends_with_app_dir() {
        assert!(default_data_root().ends_with("evidra"));
    }
}
