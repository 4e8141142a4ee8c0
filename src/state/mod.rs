//! Paper lifecycle: the state graph, the append-only transition log, the
//! SQLite store behind it, and the machine that commits transitions.

pub mod lifecycle;
pub mod machine;
pub mod record;
pub mod store;

pub use lifecycle::{HashGate, PaperState, Stage, StateTransition, TransitionRequest};
pub use machine::{CommitOutcome, LifecycleMachine, TransitionError};
pub use record::{AuditVerdict, EvidenceSpan, PaperRecord, VerifyMethod, NOT_FOUND};
pub use store::{PipelineStats, ReviewStore, RunStatus, StoreError};
