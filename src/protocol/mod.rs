//! Review protocol: the declarative screening + extraction ruleset that
//! governs one review, and the canonical hashing that detects staleness.

pub mod hash;
pub mod spec;

pub use hash::{ProtocolHash, StaleScope};
pub use spec::{
    AuditRules, ExportPreferences, ExtractionField, ExtractionSchema, ProtocolError,
    ReviewProtocol, ScreeningCriteria,
};
