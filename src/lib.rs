//! Evidra: a consistency engine for LLM-assisted systematic reviews.
//!
//! Papers move through an explicit lifecycle backed by an append-only
//! transition log. Every automated judgment is either made twice and
//! compared (screening) or verified against source text (extraction), and
//! all recorded work is stamped with a hash of the review protocol so rule
//! changes surface as staleness instead of silent inconsistency.

pub mod config;
pub mod consensus;
pub mod pipeline;
pub mod protocol;
pub mod search;
pub mod state;

use tracing_subscriber::EnvFilter;

pub use consensus::{resolve, ScreeningConsensus, ScreeningDecision, ScreeningVerdict};
pub use pipeline::{Capabilities, Coordinator, PipelineError, RunSummary};
pub use protocol::{ProtocolHash, ReviewProtocol, StaleScope};
pub use search::{Citation, DedupConfig, DedupOutcome, DedupStats};
pub use state::{LifecycleMachine, PaperState, ReviewStore, Stage};

/// Install the global tracing subscriber. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}
