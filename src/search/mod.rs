//! Candidate citations from search sources and the deduplication engine
//! that merges them into unique paper seeds.

pub mod citation;
pub mod dedup;

pub use citation::Citation;
pub use dedup::{DedupConfig, DedupGroup, DedupOutcome, DedupStats, MergeMethod};

/// Malformed input. Rejected and logged per citation, never fatal to the
/// batch it arrived in.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DataError {
    #[error("Citation {index} has no title and no identifiers")]
    MalformedCitation { index: usize },
}
