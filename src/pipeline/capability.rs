//! Capability seams: every external dependency of the pipeline (search
//! backends, document parsing, LLM screening, extraction, semantic audit)
//! sits behind one of these traits. The coordinator only sees the traits,
//! so backends swap without touching pipeline logic and tests run on mocks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::ScreeningDecision;
use crate::protocol::{ExtractionSchema, ScreeningCriteria};
use crate::search::Citation;
use crate::state::EvidenceSpan;

/// How a capability call failed. The retry layer keys off `is_retryable`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("call exceeded {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CapabilityError {
    /// Fatal errors (bad credentials, unsupported input) never retry.
    /// Everything else is assumed to be weather.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Parsed-document quality as reported by the parser backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseQuality {
    Good,
    /// Text was recovered but with known damage (OCR artifacts, dropped
    /// tables). Extraction proceeds; the audit gets stricter scrutiny.
    Degraded,
}

impl ParseQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub quality: ParseQuality,
}

/// A literature search backend (PubMed, OpenAlex, a local export, ...).
pub trait SearchSource: Send + Sync {
    /// Stable name recorded as the citation's origin.
    fn name(&self) -> &str;

    fn search(&self, query: &str) -> Result<Vec<Citation>, CapabilityError>;
}

/// Extracts plain text from an acquired PDF.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, pdf: &[u8]) -> Result<ParsedDocument, CapabilityError>;
}

/// One LLM screening pass over a citation's title and abstract.
pub trait Screener: Send + Sync {
    fn screen(
        &self,
        citation: &Citation,
        criteria: &ScreeningCriteria,
    ) -> Result<ScreeningDecision, CapabilityError>;
}

/// LLM extraction of the protocol's schema fields from parsed full text.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        document: &str,
        schema: &ExtractionSchema,
    ) -> Result<Vec<EvidenceSpan>, CapabilityError>;
}

/// Final audit-cascade step: does the document semantically support the
/// extracted value and its claimed snippet even though no literal match
/// exists? The judge sees the whole span, so it can weigh the field name
/// and value against the snippet, not just the snippet's wording.
pub trait SemanticJudge: Send + Sync {
    fn supported(&self, document: &str, span: &EvidenceSpan) -> Result<bool, CapabilityError>;
}

/// The full capability set the coordinator runs with.
#[derive(Clone)]
pub struct Capabilities {
    pub sources: Vec<std::sync::Arc<dyn SearchSource>>,
    pub parser: std::sync::Arc<dyn DocumentParser>,
    pub screener: std::sync::Arc<dyn Screener>,
    pub extractor: std::sync::Arc<dyn Extractor>,
    pub judge: std::sync::Arc<dyn SemanticJudge>,
}
