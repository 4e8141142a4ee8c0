//! Citation model shared by search sources and the dedup engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single literature citation returned by a search source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    /// Source-native identifiers keyed by source name (e.g. an OpenAlex id).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_ids: BTreeMap<String, String>,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(rename = "abstract", default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    /// Which search sources produced this citation. Unioned across merges.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub origin_sources: BTreeSet<String>,
}

const DOI_URL_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi:",
];

impl Citation {
    /// DOI in canonical comparison form: lowercased, URL prefix stripped.
    pub fn normalized_doi(&self) -> Option<String> {
        let raw = self.doi.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let mut doi = raw.to_lowercase();
        for prefix in DOI_URL_PREFIXES {
            if let Some(rest) = doi.strip_prefix(prefix) {
                doi = rest.to_string();
                break;
            }
        }
        Some(doi)
    }

    pub fn normalized_pmid(&self) -> Option<String> {
        let raw = self.pmid.as_deref()?.trim();
        if raw.is_empty() {
            None
        } else {
            Some(raw.to_string())
        }
    }

    pub fn has_identifier(&self) -> bool {
        self.normalized_doi().is_some()
            || self.normalized_pmid().is_some()
            || !self.source_ids.is_empty()
    }

    /// A citation with neither a title nor any identifier cannot be matched
    /// against anything and is rejected at dedup time.
    pub fn is_well_formed(&self) -> bool {
        !self.title.trim().is_empty() || self.has_identifier()
    }

    pub fn abstract_len(&self) -> usize {
        self.abstract_text.as_deref().map_or(0, str::len)
    }
}

fn punct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s]").expect("static regex"))
}

fn space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Lowercase, fold common Latin diacritics, strip punctuation, collapse
/// whitespace. Used for fuzzy title comparison only; the stored citation
/// keeps its original title.
pub fn normalize_title(title: &str) -> String {
    let folded: String = title.to_lowercase().chars().map(fold_diacritic).collect();
    let stripped = punct_re().replace_all(&folded, "");
    space_re().replace_all(stripped.trim(), " ").into_owned()
}

/// Latin-1 diacritic fold. Enough for journal metadata; anything outside the
/// table passes through and still compares consistently with itself.
fn fold_diacritic(c: char) -> char {
    match c {
        'à'..='å' => 'a',
        'ç' => 'c',
        'è'..='ë' => 'e',
        'ì'..='ï' => 'i',
        'ñ' => 'n',
        'ò'..='ö' | 'ø' => 'o',
        'ù'..='ü' => 'u',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Token-set Jaccard similarity between two normalized titles (0.0-1.0).
/// The metric is a replaceable parameter; the two-stage precedence and the
/// year guard in `dedup` are the load-bearing invariants.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doi_url_prefix_stripped_case_insensitive() {
        let cit = Citation {
            doi: Some("https://doi.org/10.1000/XYZ.123".into()),
            title: "t".into(),
            ..Default::default()
        };
        assert_eq!(cit.normalized_doi().unwrap(), "10.1000/xyz.123");

        let cit = Citation {
            doi: Some("DOI:10.1000/xyz.123".into()),
            title: "t".into(),
            ..Default::default()
        };
        // Prefix comparison happens after lowercasing.
        assert_eq!(cit.normalized_doi().unwrap(), "10.1000/xyz.123");
    }

    #[test]
    fn blank_doi_is_none() {
        let cit = Citation {
            doi: Some("   ".into()),
            title: "t".into(),
            ..Default::default()
        };
        assert_eq!(cit.normalized_doi(), None);
    }

    #[test]
    fn well_formed_requires_title_or_identifier() {
        let neither = Citation::default();
        assert!(!neither.is_well_formed());

        let title_only = Citation {
            title: "Some study".into(),
            ..Default::default()
        };
        assert!(title_only.is_well_formed());

        let id_only = Citation {
            pmid: Some("12345".into()),
            ..Default::default()
        };
        assert!(id_only.is_well_formed());
    }

    #[test]
    fn normalize_title_strips_punctuation_and_case() {
        assert_eq!(
            normalize_title("  Tranexamic Acid: a Meta-Analysis!  "),
            "tranexamic acid a metaanalysis"
        );
    }

    #[test]
    fn normalize_title_folds_diacritics() {
        assert_eq!(normalize_title("Étude randomisée"), "etude randomisee");
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let a = normalize_title("Tranexamic acid in total hip arthroplasty");
        let b = normalize_title("Tranexamic acid in total hip arthroplasty: an RCT");
        let s = title_similarity(&a, &b);
        assert_eq!(title_similarity(&b, &a), s);
        assert!(s > 0.0 && s < 1.0);
        assert_eq!(title_similarity(&a, &a), 1.0);
    }

    #[test]
    fn similarity_of_disjoint_titles_is_zero() {
        assert_eq!(title_similarity("alpha beta", "gamma delta"), 0.0);
    }
}
