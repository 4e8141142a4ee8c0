//! Review protocol model and validation.
//!
//! A protocol is a versioned document: screening criteria, an ordered
//! extraction field schema, audit rules, and export preferences. Screening
//! and extraction sections are immutable once hashed; any semantic edit
//! produces a new section hash (see `hash`). Export preferences are cosmetic
//! and never participate in hashing.

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating a protocol document.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid protocol: {0}")]
    Validation(String),
}

/// Inclusion/exclusion rules for title-abstract screening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningCriteria {
    pub inclusion: Vec<String>,
    pub exclusion: Vec<String>,
}

/// A single field to extract from a paper's full text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub description: String,
    /// 1 = required, 2 = important, 3 = optional.
    pub tier: u8,
    /// Allowed values when `field_type` is "enum".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

/// Ordered extraction field schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub fields: Vec<ExtractionField>,
}

impl ExtractionSchema {
    pub fn fields_by_tier(&self, tier: u8) -> Vec<&ExtractionField> {
        self.fields.iter().filter(|f| f.tier == tier).collect()
    }

    pub fn field(&self, name: &str) -> Option<&ExtractionField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Verification knobs for the audit cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRules {
    /// Minimum token-overlap ratio for cascade step 3.
    pub token_overlap_threshold: f64,
    /// Whether cascade step 4 (semantic judge) may run at all.
    pub semantic_step_enabled: bool,
}

impl Default for AuditRules {
    fn default() -> Self {
        Self {
            token_overlap_threshold: 0.8,
            semantic_step_enabled: true,
        }
    }
}

/// Export/report formatting preferences. Deliberately outside the hashed
/// sections so cosmetic export changes never mark papers stale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportPreferences {
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub include_abstracts: bool,
}

/// Top-level review protocol document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewProtocol {
    pub title: String,
    pub version: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub screening: ScreeningCriteria,
    pub extraction: ExtractionSchema,
    #[serde(default)]
    pub audit: AuditRules,
    #[serde(default)]
    pub export: ExportPreferences,
}

impl ReviewProtocol {
    /// Parse a protocol from JSON and validate it.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let protocol: Self = serde_json::from_str(raw)?;
        protocol.validate()?;
        Ok(protocol)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.extraction.fields.is_empty() {
            return Err(ProtocolError::Validation(
                "extraction schema has no fields".into(),
            ));
        }
        if !self.extraction.fields.iter().any(|f| f.tier == 1) {
            return Err(ProtocolError::Validation(
                "extraction schema must have at least one tier-1 field".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.extraction.fields {
            if field.name.trim().is_empty() {
                return Err(ProtocolError::Validation("extraction field with empty name".into()));
            }
            if !(1..=3).contains(&field.tier) {
                return Err(ProtocolError::Validation(format!(
                    "field '{}' has tier {} (must be 1-3)",
                    field.name, field.tier
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ProtocolError::Validation(format!(
                    "duplicate extraction field '{}'",
                    field.name
                )));
            }
        }
        if self.screening.inclusion.is_empty() {
            return Err(ProtocolError::Validation(
                "screening criteria need at least one inclusion rule".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.audit.token_overlap_threshold) {
            return Err(ProtocolError::Validation(format!(
                "token_overlap_threshold {} outside 0.0-1.0",
                self.audit.token_overlap_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_protocol() -> ReviewProtocol {
        ReviewProtocol {
            title: "Tranexamic acid in hip arthroplasty".into(),
            version: "1.0".into(),
            authors: vec!["Reviewer A".into(), "Reviewer B".into()],
            screening: ScreeningCriteria {
                inclusion: vec![
                    "Randomized controlled trial".into(),
                    "Adult patients undergoing hip arthroplasty".into(),
                ],
                exclusion: vec!["Animal studies".into(), "Case reports".into()],
            },
            extraction: ExtractionSchema {
                fields: vec![
                    ExtractionField {
                        name: "sample_size".into(),
                        field_type: "int".into(),
                        description: "Total randomized participants".into(),
                        tier: 1,
                        enum_values: None,
                    },
                    ExtractionField {
                        name: "primary_outcome".into(),
                        field_type: "str".into(),
                        description: "Primary outcome measure".into(),
                        tier: 1,
                        enum_values: None,
                    },
                    ExtractionField {
                        name: "blinding".into(),
                        field_type: "enum".into(),
                        description: "Blinding design".into(),
                        tier: 2,
                        enum_values: Some(vec!["open".into(), "single".into(), "double".into()]),
                    },
                ],
            },
            audit: AuditRules::default(),
            export: ExportPreferences::default(),
        }
    }

    #[test]
    fn valid_protocol_passes() {
        assert!(sample_protocol().validate().is_ok());
    }

    #[test]
    fn rejects_schema_without_tier1_field() {
        let mut p = sample_protocol();
        for f in &mut p.extraction.fields {
            f.tier = 2;
        }
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("tier-1"));
    }

    #[test]
    fn rejects_duplicate_field_names() {
        let mut p = sample_protocol();
        let dup = p.extraction.fields[0].clone();
        p.extraction.fields.push(dup);
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_empty_inclusion_rules() {
        let mut p = sample_protocol();
        p.screening.inclusion.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn parses_from_json() {
        let raw = serde_json::to_string(&sample_protocol()).unwrap();
        let parsed = ReviewProtocol::from_json(&raw).unwrap();
        assert_eq!(parsed, sample_protocol());
    }

    #[test]
    fn fields_by_tier_filters() {
        let p = sample_protocol();
        assert_eq!(p.extraction.fields_by_tier(1).len(), 2);
        assert_eq!(p.extraction.fields_by_tier(2).len(), 1);
        assert_eq!(p.extraction.fields_by_tier(3).len(), 0);
    }
}
