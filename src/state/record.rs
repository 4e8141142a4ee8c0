//! Per-paper work products: evidence spans from extraction and the audit
//! verdicts that verify them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lifecycle::PaperState;
use crate::search::Citation;

/// Sentinel value an extractor reports for a schema field absent from the
/// paper. Such fields carry no evidence and are trivially verified.
pub const NOT_FOUND: &str = "NOT_FOUND";

/// One extracted field with its claimed evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub field_name: String,
    pub value: String,
    /// Verbatim quote from the parsed document supporting the value.
    pub source_snippet: String,
    /// Free-form evidence location (section heading, page marker).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl EvidenceSpan {
    pub fn is_not_found(&self) -> bool {
        self.value == NOT_FOUND
    }
}

/// Which cascade step verified a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMethod {
    Exact,
    Normalized,
    TokenOverlap,
    Semantic,
    /// Nothing to audit (field was reported NOT_FOUND).
    NothingToAudit,
}

impl VerifyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Normalized => "normalized",
            Self::TokenOverlap => "token_overlap",
            Self::Semantic => "semantic",
            Self::NothingToAudit => "nothing_to_audit",
        }
    }
}

impl std::str::FromStr for VerifyMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "normalized" => Ok(Self::Normalized),
            "token_overlap" => Ok(Self::TokenOverlap),
            "semantic" => Ok(Self::Semantic),
            "nothing_to_audit" => Ok(Self::NothingToAudit),
            other => Err(format!("unknown verify method '{other}'")),
        }
    }
}

/// Audit outcome for a single extracted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub field_name: String,
    pub verified: bool,
    /// Set when verified; the step that succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<VerifyMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The unit of work: a deduplicated paper with its projected state.
/// The full transition log, evidence, and verdicts live in the store and
/// are loaded on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub paper_id: Uuid,
    pub citation: Citation,
    pub state: PaperState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_sentinel() {
        let span = EvidenceSpan {
            field_name: "sample_size".into(),
            value: NOT_FOUND.into(),
            source_snippet: String::new(),
            location: None,
        };
        assert!(span.is_not_found());
    }

    #[test]
    fn verify_method_round_trips() {
        for m in [
            VerifyMethod::Exact,
            VerifyMethod::Normalized,
            VerifyMethod::TokenOverlap,
            VerifyMethod::Semantic,
            VerifyMethod::NothingToAudit,
        ] {
            assert_eq!(m.as_str().parse::<VerifyMethod>().unwrap(), m);
        }
    }
}
