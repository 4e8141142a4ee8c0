//! Deduplication engine: merges candidate citations from multiple sources
//! into a unique set of paper seeds.
//!
//! Two stages, in strict precedence order:
//! 1. Exact identifier match: shared normalized DOI or shared PMID always
//!    merges, regardless of title similarity.
//! 2. Fuzzy title match on the remaining ungrouped citations: token-set
//!    similarity at or above a threshold AND publication year within ±1
//!    (guards against errata and conference/journal twins sharing a title).
//!
//! Grouping is the transitive closure of the match relation, so membership
//! is independent of input order; canonical-field selection uses a stated
//! deterministic tie-break.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::citation::{normalize_title, title_similarity, Citation};
use super::DataError;

/// Tunables for the fuzzy stage. The similarity metric itself is a
/// replaceable parameter (see `citation::title_similarity`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub title_threshold: f64,
    pub year_window: i32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_threshold: 0.92,
            year_window: 1,
        }
    }
}

/// How a group of citations was judged to be one paper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MergeMethod {
    ExactId,
    /// Weakest pairwise similarity that linked the group.
    FuzzyTitle { score: f64 },
}

/// A cluster of input citations judged to represent one paper. Indices
/// refer to the original input sequence. Only emitted for clusters of two
/// or more members; singletons go straight to seeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupGroup {
    pub members: Vec<usize>,
    pub canonical: usize,
    pub method: MergeMethod,
}

/// Audit-trail counts. Reported, never silently dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub input: usize,
    pub rejected: usize,
    pub exact_merged: usize,
    pub fuzzy_merged: usize,
    pub unique: usize,
}

/// Full dedup output: merged seeds (in order of each group's first input
/// index), merge provenance, stats, and rejected inputs.
#[derive(Debug)]
pub struct DedupOutcome {
    pub seeds: Vec<Citation>,
    pub groups: Vec<DedupGroup>,
    pub stats: DedupStats,
    pub rejected: Vec<DataError>,
}

/// Run both dedup stages over a batch of candidate citations.
pub fn dedup(citations: &[Citation], config: &DedupConfig) -> DedupOutcome {
    let mut rejected = Vec::new();
    let valid: Vec<usize> = (0..citations.len())
        .filter(|&i| {
            if citations[i].is_well_formed() {
                true
            } else {
                tracing::warn!(index = i, "Rejecting malformed citation");
                rejected.push(DataError::MalformedCitation { index: i });
                false
            }
        })
        .collect();

    let mut sets = UnionFind::new(citations.len());

    // Stage 1: exact identifier match.
    let mut by_doi: HashMap<String, usize> = HashMap::new();
    let mut by_pmid: HashMap<String, usize> = HashMap::new();
    for &i in &valid {
        if let Some(doi) = citations[i].normalized_doi() {
            match by_doi.get(&doi) {
                Some(&first) => sets.union(first, i),
                None => {
                    by_doi.insert(doi, i);
                }
            }
        }
        if let Some(pmid) = citations[i].normalized_pmid() {
            match by_pmid.get(&pmid) {
                Some(&first) => sets.union(first, i),
                None => {
                    by_pmid.insert(pmid, i);
                }
            }
        }
    }

    let mut valid_mask = vec![false; citations.len()];
    for &i in &valid {
        valid_mask[i] = true;
    }
    let exact_grouped: Vec<bool> = (0..citations.len())
        .map(|i| valid_mask[i] && sets.cluster_size(i) > 1)
        .collect();

    // Stage 2: fuzzy title match on citations untouched by stage 1. Pairs
    // are scanned in fixed input-index order; because grouping takes the
    // transitive closure, membership does not depend on that order.
    let fuzzy_candidates: Vec<usize> = valid
        .iter()
        .copied()
        .filter(|&i| !exact_grouped[i])
        .collect();
    let norm_titles: HashMap<usize, String> = fuzzy_candidates
        .iter()
        .map(|&i| (i, normalize_title(&citations[i].title)))
        .collect();

    let mut fuzzy_pairs: Vec<(usize, usize, f64)> = Vec::new();
    for (a_pos, &a) in fuzzy_candidates.iter().enumerate() {
        for &b in &fuzzy_candidates[a_pos + 1..] {
            if norm_titles[&a].is_empty() || norm_titles[&b].is_empty() {
                continue;
            }
            let (Some(ya), Some(yb)) = (citations[a].year, citations[b].year) else {
                // Year guard needs both years; without them a same-title
                // merge cannot be distinguished from an erratum.
                continue;
            };
            if (ya - yb).abs() > config.year_window {
                continue;
            }
            let score = title_similarity(&norm_titles[&a], &norm_titles[&b]);
            if score >= config.title_threshold {
                sets.union(a, b);
                fuzzy_pairs.push((a, b, score));
            }
        }
    }

    // Collect clusters keyed by their lowest member index.
    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for &i in &valid {
        clusters.entry(sets.find(i)).or_default().push(i);
    }
    let mut ordered: Vec<Vec<usize>> = clusters.into_values().collect();
    for members in &mut ordered {
        members.sort_unstable();
    }
    ordered.sort_unstable_by_key(|members| members[0]);

    let mut seeds = Vec::with_capacity(ordered.len());
    let mut groups = Vec::new();
    let mut exact_merged = 0;
    let mut fuzzy_merged = 0;

    for members in &ordered {
        let canonical = pick_canonical(citations, members);
        seeds.push(merge_members(citations, members, canonical));
        if members.len() > 1 {
            let method = if exact_grouped[members[0]] {
                exact_merged += members.len() - 1;
                MergeMethod::ExactId
            } else {
                fuzzy_merged += members.len() - 1;
                // Weakest link among the pairs that stitched this group.
                let score = fuzzy_pairs
                    .iter()
                    .filter(|(a, b, _)| members.binary_search(a).is_ok() && members.binary_search(b).is_ok())
                    .map(|&(_, _, s)| s)
                    .fold(1.0_f64, f64::min);
                MergeMethod::FuzzyTitle { score }
            };
            groups.push(DedupGroup {
                members: members.clone(),
                canonical,
                method,
            });
        }
    }

    let stats = DedupStats {
        input: citations.len(),
        rejected: rejected.len(),
        exact_merged,
        fuzzy_merged,
        unique: seeds.len(),
    };
    tracing::info!(
        input = stats.input,
        rejected = stats.rejected,
        exact_merged = stats.exact_merged,
        fuzzy_merged = stats.fuzzy_merged,
        unique = stats.unique,
        "Deduplication complete"
    );

    DedupOutcome {
        seeds,
        groups,
        stats,
        rejected,
    }
}

/// Canonical member: longest abstract, then most complete author list. Ties
/// fall through to content (lexicographically smallest normalized title,
/// then identifiers), never to input position, so the pick is the same for
/// any permutation of the input.
fn pick_canonical(citations: &[Citation], members: &[usize]) -> usize {
    let mut best = members[0];
    for &i in &members[1..] {
        let (c, b) = (&citations[i], &citations[best]);
        let better = c
            .abstract_len()
            .cmp(&b.abstract_len())
            .then(c.authors.len().cmp(&b.authors.len()))
            .then_with(|| normalize_title(&b.title).cmp(&normalize_title(&c.title)))
            .then_with(|| b.normalized_doi().cmp(&c.normalized_doi()))
            .then_with(|| b.normalized_pmid().cmp(&c.normalized_pmid()));
        if better == std::cmp::Ordering::Greater {
            best = i;
        }
    }
    best
}

/// Merge a cluster into one citation: canonical fields win, gaps are filled
/// from other members in index order, identifiers and origins are unions.
fn merge_members(citations: &[Citation], members: &[usize], canonical: usize) -> Citation {
    let mut merged = citations[canonical].clone();
    for &i in members {
        if i == canonical {
            continue;
        }
        let other = &citations[i];
        if merged.doi.is_none() {
            merged.doi = other.doi.clone();
        }
        if merged.pmid.is_none() {
            merged.pmid = other.pmid.clone();
        }
        if merged.year.is_none() {
            merged.year = other.year;
        }
        if merged.journal.is_none() {
            merged.journal = other.journal.clone();
        }
        if merged.abstract_text.is_none() {
            merged.abstract_text = other.abstract_text.clone();
        }
        if merged.authors.is_empty() {
            merged.authors = other.authors.clone();
        }
        for (source, id) in &other.source_ids {
            merged
                .source_ids
                .entry(source.clone())
                .or_insert_with(|| id.clone());
        }
        merged
            .origin_sources
            .extend(other.origin_sources.iter().cloned());
    }
    merged
}

/// Union-find over input indices with path compression.
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        // Attach the higher root under the lower so roots stay stable and
        // deterministic regardless of union order.
        let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[high] = low;
        self.size[low] += self.size[high];
    }

    fn cluster_size(&mut self, x: usize) -> usize {
        let root = self.find(x);
        self.size[root]
    }
}
