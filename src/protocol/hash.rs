//! Canonical protocol hashing and staleness scoping.
//!
//! Each hashed section (screening criteria, extraction schema) is serialized
//! to canonical JSON (sorted object keys, no insignificant whitespace) and
//! digested with SHA-256. Hashing from the typed model means input
//! formatting, key order, and comments can never change the hash; only a
//! semantic edit to a section can.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::spec::{ProtocolError, ReviewProtocol};

/// Section hashes stamped onto every state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHash {
    pub screening: String,
    pub extraction: String,
}

/// How much of a paper's recorded progress a protocol change invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleScope {
    /// Screening rules changed: screening and everything downstream is stale.
    FromScreening,
    /// Only the extraction schema changed: extraction and audit are stale,
    /// screening decisions still stand.
    FromExtraction,
}

impl ProtocolHash {
    /// Compare the live hash (`self`) against a recorded one. `None` means
    /// the recorded progress is current. Staleness is surfaced, never
    /// auto-repaired; re-running affected stages is an explicit action.
    pub fn staleness(&self, recorded: &ProtocolHash) -> Option<StaleScope> {
        if self.screening != recorded.screening {
            Some(StaleScope::FromScreening)
        } else if self.extraction != recorded.extraction {
            Some(StaleScope::FromExtraction)
        } else {
            None
        }
    }

    /// Abbreviated `screening/extraction` form for logs. A hash shorter
    /// than the abbreviation (possible on deserialized input) is shown
    /// whole.
    pub fn short(&self) -> String {
        fn clip(h: &str) -> &str {
            h.get(..12).unwrap_or(h)
        }
        format!("{}/{}", clip(&self.screening), clip(&self.extraction))
    }
}

impl ReviewProtocol {
    /// Deterministic fingerprint of the screening + extraction sections.
    /// Export preferences and descriptive metadata (title, authors) are
    /// excluded so cosmetic edits never trigger staleness.
    pub fn protocol_hash(&self) -> Result<ProtocolHash, ProtocolError> {
        Ok(ProtocolHash {
            screening: canonical_hash(&self.screening)?,
            extraction: canonical_hash(&self.extraction)?,
        })
    }
}

/// SHA-256 over the canonical JSON form of a section.
fn canonical_hash<T: Serialize>(section: &T) -> Result<String, ProtocolError> {
    // Round-tripping through Value sorts object keys (serde_json's map is
    // ordered by key) and drops all formatting.
    let value = serde_json::to_value(section)?;
    let blob = serde_json::to_string(&value)?;
    let digest = Sha256::digest(blob.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::spec::tests::sample_protocol;

    #[test]
    fn hash_is_deterministic() {
        let p = sample_protocol();
        assert_eq!(p.protocol_hash().unwrap(), p.protocol_hash().unwrap());
    }

    #[test]
    fn formatting_does_not_change_hash() {
        let p = sample_protocol();
        // Same semantic content, serialized with different whitespace and
        // (after parsing) different original key order.
        let compact = serde_json::to_string(&p).unwrap();
        let pretty = serde_json::to_string_pretty(&p).unwrap();
        let from_compact = ReviewProtocol::from_json(&compact).unwrap();
        let from_pretty = ReviewProtocol::from_json(&pretty).unwrap();
        assert_eq!(
            from_compact.protocol_hash().unwrap(),
            from_pretty.protocol_hash().unwrap()
        );
    }

    #[test]
    fn screening_edit_changes_only_screening_hash() {
        let p = sample_protocol();
        let mut edited = p.clone();
        edited.screening.exclusion.push("Pediatric cohorts".into());
        let h1 = p.protocol_hash().unwrap();
        let h2 = edited.protocol_hash().unwrap();
        assert_ne!(h1.screening, h2.screening);
        assert_eq!(h1.extraction, h2.extraction);
    }

    #[test]
    fn schema_edit_changes_only_extraction_hash() {
        let p = sample_protocol();
        let mut edited = p.clone();
        edited.extraction.fields[0].description = "Participants randomized".into();
        let h1 = p.protocol_hash().unwrap();
        let h2 = edited.protocol_hash().unwrap();
        assert_eq!(h1.screening, h2.screening);
        assert_ne!(h1.extraction, h2.extraction);
    }

    #[test]
    fn export_edit_never_changes_hash() {
        let p = sample_protocol();
        let mut edited = p.clone();
        edited.export.formats.push("docx".into());
        edited.export.include_abstracts = true;
        edited.title = "Renamed review".into();
        assert_eq!(p.protocol_hash().unwrap(), edited.protocol_hash().unwrap());
    }

    #[test]
    fn field_order_is_semantic() {
        // The schema is an *ordered* field list; swapping fields is an edit.
        let p = sample_protocol();
        let mut edited = p.clone();
        edited.extraction.fields.swap(0, 1);
        assert_ne!(
            p.protocol_hash().unwrap().extraction,
            edited.protocol_hash().unwrap().extraction
        );
    }

    #[test]
    fn short_form_tolerates_truncated_hashes() {
        let h = sample_protocol().protocol_hash().unwrap();
        assert_eq!(h.short().len(), 25);

        let odd = ProtocolHash {
            screening: "abc".into(),
            extraction: "0123456789abcdef".into(),
        };
        assert_eq!(odd.short(), "abc/0123456789ab");
    }

    #[test]
    fn staleness_scopes() {
        let p = sample_protocol();
        let live = p.protocol_hash().unwrap();

        assert_eq!(live.staleness(&live), None);

        let mut screening_edit = p.clone();
        screening_edit.screening.inclusion.push("English language".into());
        let new_live = screening_edit.protocol_hash().unwrap();
        assert_eq!(new_live.staleness(&live), Some(StaleScope::FromScreening));

        let mut schema_edit = p.clone();
        schema_edit.extraction.fields[0].tier = 2;
        let new_live = schema_edit.protocol_hash().unwrap();
        assert_eq!(new_live.staleness(&live), Some(StaleScope::FromExtraction));
    }
}
