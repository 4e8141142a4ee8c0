//! Extraction audit: verify every evidence span against the parsed document
//! with a cheapest-first cascade. A step only runs if every cheaper step
//! failed, and the semantic judge is consulted last.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::pipeline::capability::{CapabilityError, SemanticJudge};
use crate::protocol::AuditRules;
use crate::state::{AuditVerdict, EvidenceSpan, VerifyMethod};

/// Paper-level audit summary. `passed` only when every field verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAudit {
    pub verdicts: Vec<AuditVerdict>,
    pub passed: bool,
    pub unverified_fields: Vec<String>,
}

/// The verification cascade, parameterized by the protocol's audit rules.
pub struct AuditCascade {
    rules: AuditRules,
}

impl AuditCascade {
    pub fn new(rules: AuditRules) -> Self {
        Self { rules }
    }

    /// Audit one evidence span against the parsed document text.
    pub fn audit_field(
        &self,
        document: &str,
        span: &EvidenceSpan,
        judge: &dyn SemanticJudge,
    ) -> Result<AuditVerdict, CapabilityError> {
        if span.is_not_found() {
            return Ok(verdict(span, true, Some(VerifyMethod::NothingToAudit), None));
        }
        if span.source_snippet.trim().is_empty() {
            return Ok(verdict(
                span,
                false,
                None,
                Some("extracted value carries no supporting snippet".into()),
            ));
        }

        if document.contains(&span.source_snippet) {
            return Ok(verdict(span, true, Some(VerifyMethod::Exact), None));
        }

        let doc_norm = normalize(document);
        let snippet_norm = normalize(&span.source_snippet);
        if doc_norm.contains(&snippet_norm) {
            return Ok(verdict(span, true, Some(VerifyMethod::Normalized), None));
        }

        let overlap = best_window_overlap(&doc_norm, &snippet_norm);
        if overlap >= self.rules.token_overlap_threshold {
            return Ok(verdict(
                span,
                true,
                Some(VerifyMethod::TokenOverlap),
                Some(format!("overlap {overlap:.2}")),
            ));
        }

        if self.rules.semantic_step_enabled && judge.supported(document, span)? {
            return Ok(verdict(span, true, Some(VerifyMethod::Semantic), None));
        }

        Ok(verdict(
            span,
            false,
            None,
            Some(format!(
                "snippet not found in document (best token overlap {overlap:.2})"
            )),
        ))
    }

    /// Audit all of a paper's evidence spans.
    pub fn audit_paper(
        &self,
        document: &str,
        spans: &[EvidenceSpan],
        judge: &dyn SemanticJudge,
    ) -> Result<PaperAudit, CapabilityError> {
        let mut verdicts = Vec::with_capacity(spans.len());
        for span in spans {
            verdicts.push(self.audit_field(document, span, judge)?);
        }
        let unverified_fields: Vec<String> = verdicts
            .iter()
            .filter(|v| !v.verified)
            .map(|v| v.field_name.clone())
            .collect();
        Ok(PaperAudit {
            passed: unverified_fields.is_empty(),
            verdicts,
            unverified_fields,
        })
    }
}

fn verdict(
    span: &EvidenceSpan,
    verified: bool,
    method: Option<VerifyMethod>,
    detail: Option<String>,
) -> AuditVerdict {
    AuditVerdict {
        field_name: span.field_name.clone(),
        verified,
        method,
        detail,
    }
}

/// Lowercase and reduce to alphanumeric words separated by single spaces.
fn normalize(text: &str) -> String {
    let mapped: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Highest distinct-token overlap between the snippet and any document
/// window of the snippet's length. Both inputs are already normalized.
fn best_window_overlap(doc_norm: &str, snippet_norm: &str) -> f64 {
    let snippet_tokens: BTreeSet<&str> = snippet_norm.split_whitespace().collect();
    if snippet_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens: Vec<&str> = doc_norm.split_whitespace().collect();
    let win = snippet_norm.split_whitespace().count().min(doc_tokens.len().max(1));
    if doc_tokens.is_empty() {
        return 0.0;
    }

    let mut best = 0.0_f64;
    let last_start = doc_tokens.len() - win;
    for start in 0..=last_start {
        let window: BTreeSet<&str> = doc_tokens[start..start + win].iter().copied().collect();
        let matched = snippet_tokens.intersection(&window).count();
        let ratio = matched as f64 / snippet_tokens.len() as f64;
        if ratio > best {
            best = ratio;
            if best >= 1.0 {
                break;
            }
        }
    }
    best
}
