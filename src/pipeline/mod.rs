//! Stage pipeline: capability seams, retry policy, and the coordinator
//! that drives papers through the lifecycle.

pub mod capability;
pub mod coordinator;
pub mod retry;

pub use capability::{
    Capabilities, CapabilityError, DocumentParser, Extractor, ParseQuality, ParsedDocument,
    Screener, SearchSource, SemanticJudge,
};
pub use coordinator::{Coordinator, PipelineError, RunSummary, StagePools, StageStats};
pub use retry::{RetryExhausted, RetryPolicy};
