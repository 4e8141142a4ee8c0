//! Pipeline coordinator: ingests deduplicated citations, drives the stage
//! worker pools, and owns run bookkeeping. All lifecycle writes go through
//! the machine; the coordinator never touches the transition log directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use super::capability::{Capabilities, CapabilityError};
use super::retry::RetryExhausted;
use crate::config::EngineConfig;
use crate::consensus::{self, AuditCascade, ScreeningDecision};
use crate::protocol::{ExtractionSchema, ProtocolError, ProtocolHash, ReviewProtocol, StaleScope};
use crate::search::{dedup, Citation, DedupStats};
use crate::state::{
    CommitOutcome, EvidenceSpan, LifecycleMachine, PaperRecord, PaperState, ReviewStore, RunStatus,
    Stage, StoreError, TransitionError, TransitionRequest, NOT_FOUND,
};

/// Structural pipeline failures. Per-paper trouble never surfaces here; it
/// becomes a `Failed` state on the paper instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("citations already ingested for this review")]
    AlreadyIngested,
}

/// Worker counts per stage. Screening is cheap per call and wide; the
/// full-text stages are heavier and narrower.
#[derive(Debug, Clone)]
pub struct StagePools {
    pub screen: usize,
    pub parse: usize,
    pub extract: usize,
    pub audit: usize,
}

impl Default for StagePools {
    fn default() -> Self {
        Self {
            screen: 4,
            parse: 2,
            extract: 2,
            audit: 2,
        }
    }
}

impl StagePools {
    fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Screen => self.screen,
            Stage::Parse => self.parse,
            Stage::Extract => self.extract,
            Stage::Audit => self.audit,
        }
    }
}

/// Per-stage counts for one run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageStats {
    pub advanced: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Outcome of one full pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub screen: StageStats,
    pub parse: StageStats,
    pub extract: StageStats,
    pub audit: StageStats,
}

enum Processed {
    Advanced,
    Failed,
    Skipped,
}

/// The state a stage's workers pull papers from.
fn source_state(stage: Stage) -> PaperState {
    match stage {
        Stage::Screen => PaperState::Ingested,
        Stage::Parse => PaperState::PdfAcquired,
        Stage::Extract => PaperState::Parsed,
        Stage::Audit => PaperState::Extracted,
    }
}

/// A representative commit target for the stage. All of a stage's possible
/// outcomes share one hash gate, so any of them answers the staleness
/// pre-check.
fn target_state(stage: Stage) -> PaperState {
    match stage {
        Stage::Screen => PaperState::ScreenedIn,
        Stage::Parse => PaperState::Parsed,
        Stage::Extract => PaperState::Extracted,
        Stage::Audit => PaperState::Audited,
    }
}

pub struct Coordinator {
    store: Arc<ReviewStore>,
    machine: Arc<LifecycleMachine>,
    protocol: ReviewProtocol,
    hash: ProtocolHash,
    caps: Capabilities,
    config: EngineConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<ReviewStore>,
        protocol: ReviewProtocol,
        caps: Capabilities,
        config: EngineConfig,
    ) -> Result<Self, PipelineError> {
        protocol.validate()?;
        let hash = protocol.protocol_hash()?;
        let machine = Arc::new(LifecycleMachine::new(Arc::clone(&store), hash.clone()));
        tracing::info!(
            protocol = %protocol.title,
            version = %protocol.version,
            hash = %hash.short(),
            "Coordinator ready"
        );
        Ok(Self {
            store,
            machine,
            protocol,
            hash,
            caps,
            config,
        })
    }

    pub fn machine(&self) -> &Arc<LifecycleMachine> {
        &self.machine
    }

    pub fn protocol_hash(&self) -> &ProtocolHash {
        &self.hash
    }

    // ── Ingestion ────────────────────────────────────────────

    /// Deduplicate a citation batch and register the unique seeds. Runs
    /// exactly once per review; a second call is refused rather than
    /// re-deduplicated against existing papers.
    pub fn ingest(&self, citations: &[Citation]) -> Result<DedupStats, PipelineError> {
        if self.store.has_papers()? {
            return Err(PipelineError::AlreadyIngested);
        }
        let outcome = dedup::dedup(citations, &self.config.dedup);
        for seed in &outcome.seeds {
            let payload = serde_json::json!({
                "origin_sources": seed.origin_sources,
            });
            self.store.register_paper(seed, &self.hash, payload)?;
        }
        self.store.record_dedup_stats(&outcome.stats)?;
        tracing::info!(
            input = outcome.stats.input,
            unique = outcome.stats.unique,
            rejected = outcome.stats.rejected,
            "Ingest complete"
        );
        Ok(outcome.stats)
    }

    /// Query every configured search source, tag origins, and ingest the
    /// combined batch. A source that keeps failing is logged and skipped;
    /// the remaining sources still contribute.
    pub fn search_and_ingest(&self, query: &str) -> Result<DedupStats, PipelineError> {
        let mut batch = Vec::new();
        for source in &self.caps.sources {
            let name = source.name().to_string();
            let result = self.config.retry.run(&format!("search.{name}"), || {
                let source = Arc::clone(source);
                let query = query.to_string();
                self.config
                    .retry
                    .call_with_timeout(move || source.search(&query))
            });
            match result {
                Ok(mut citations) => {
                    for c in &mut citations {
                        if c.origin_sources.is_empty() {
                            c.origin_sources.insert(name.clone());
                        }
                    }
                    tracing::info!(source = %name, count = citations.len(), "Search source returned");
                    batch.extend(citations);
                }
                Err(err) => {
                    tracing::error!(source = %name, %err, "Search source skipped");
                }
            }
        }
        self.ingest(&batch)
    }

    /// Record a manually acquired PDF and advance the paper. Acquisition is
    /// a host action, not a capability; full-text retrieval is out of scope.
    pub fn mark_pdf_acquired(&self, paper_id: Uuid, pdf: &[u8]) -> Result<(), PipelineError> {
        self.store.put_pdf(paper_id, pdf)?;
        self.machine.commit(TransitionRequest {
            paper_id,
            to_state: PaperState::PdfAcquired,
            actor: "manual".into(),
            observed_hash: self.hash.clone(),
            payload: serde_json::json!({ "bytes": pdf.len() }),
        })?;
        Ok(())
    }

    // ── Running ──────────────────────────────────────────────

    /// Run every stage pool once, in lifecycle order. Idempotent: a rerun
    /// picks up wherever each paper currently is.
    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let run_id = self.store.start_run(&self.hash)?;
        match self.run_stages() {
            Ok((screen, parse, extract, audit)) => {
                self.store.finish_run(run_id, RunStatus::Completed)?;
                Ok(RunSummary {
                    run_id,
                    screen,
                    parse,
                    extract,
                    audit,
                })
            }
            Err(err) => {
                // Best effort; the original error is the one to surface.
                let _ = self.store.finish_run(run_id, RunStatus::Failed);
                Err(err)
            }
        }
    }

    fn run_stages(&self) -> Result<(StageStats, StageStats, StageStats, StageStats), PipelineError> {
        Ok((
            self.run_stage(Stage::Screen)?,
            self.run_stage(Stage::Parse)?,
            self.run_stage(Stage::Extract)?,
            self.run_stage(Stage::Audit)?,
        ))
    }

    fn run_stage(&self, stage: Stage) -> Result<StageStats, PipelineError> {
        let candidates = self.store.papers_in_state(source_state(stage))?;
        // A paper whose last stamp the machine would refuse as stale is
        // skipped here, before any capability call is spent on it.
        let target = target_state(stage);
        let mut papers = Vec::with_capacity(candidates.len());
        let mut stale_skipped = 0usize;
        for paper in candidates {
            match self.machine.stamp_staleness(paper.paper_id, target)? {
                Some(scope) => {
                    tracing::warn!(paper = %paper.paper_id, %stage, ?scope, "Skipping stale paper");
                    stale_skipped += 1;
                }
                None => papers.push(paper),
            }
        }
        if papers.is_empty() {
            return Ok(StageStats {
                skipped: stale_skipped,
                ..StageStats::default()
            });
        }
        let workers = self.config.pools.for_stage(stage).max(1).min(papers.len());
        tracing::info!(%stage, papers = papers.len(), workers, "Stage started");

        let queue = Mutex::new(VecDeque::from(papers));
        let advanced = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(stale_skipped);
        let structural: Mutex<Option<PipelineError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    {
                        let held = structural.lock().unwrap_or_else(PoisonError::into_inner);
                        if held.is_some() {
                            break;
                        }
                    }
                    let paper = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(paper) = paper else { break };
                    match self.process_one(stage, &paper) {
                        Ok(Processed::Advanced) => {
                            advanced.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Processed::Failed) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Processed::Skipped) => {
                            skipped.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            *structural.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                            break;
                        }
                    }
                });
            }
        });

        if let Some(err) = structural
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }
        let stats = StageStats {
            advanced: advanced.into_inner(),
            failed: failed.into_inner(),
            skipped: skipped.into_inner(),
        };
        tracing::info!(%stage, ?stats, "Stage finished");
        Ok(stats)
    }

    fn process_one(&self, stage: Stage, paper: &PaperRecord) -> Result<Processed, PipelineError> {
        match stage {
            Stage::Screen => self.screen_one(paper),
            Stage::Parse => self.parse_one(paper),
            Stage::Extract => self.extract_one(paper),
            Stage::Audit => self.audit_one(paper),
        }
    }

    fn screen_one(&self, paper: &PaperRecord) -> Result<Processed, PipelineError> {
        let pass1 = match self.screen_pass("screen.pass1", &paper.citation) {
            Ok(d) => d,
            Err(e) => return self.fail_paper(paper, Stage::Screen, e),
        };
        let pass2 = match self.screen_pass("screen.pass2", &paper.citation) {
            Ok(d) => d,
            Err(e) => return self.fail_paper(paper, Stage::Screen, e),
        };
        let consensus = consensus::resolve(pass1, pass2);
        let payload = serde_json::to_value(&consensus)?;
        self.commit_or_skip(TransitionRequest {
            paper_id: paper.paper_id,
            to_state: consensus.outcome,
            actor: "screen-worker".into(),
            observed_hash: self.hash.clone(),
            payload,
        })
    }

    fn screen_pass(
        &self,
        label: &str,
        citation: &Citation,
    ) -> Result<ScreeningDecision, RetryExhausted> {
        self.config.retry.run(label, || {
            let screener = Arc::clone(&self.caps.screener);
            let citation = citation.clone();
            let criteria = self.protocol.screening.clone();
            self.config
                .retry
                .call_with_timeout(move || screener.screen(&citation, &criteria))
        })
    }

    fn parse_one(&self, paper: &PaperRecord) -> Result<Processed, PipelineError> {
        let Some(pdf) = self.store.pdf(paper.paper_id)? else {
            let err = RetryExhausted {
                attempts: 1,
                error: CapabilityError::Fatal("no PDF stored for acquired paper".into()),
            };
            return self.fail_paper(paper, Stage::Parse, err);
        };

        let parsed = self.config.retry.run("parse", || {
            let parser = Arc::clone(&self.caps.parser);
            let bytes = pdf.clone();
            self.config
                .retry
                .call_with_timeout(move || parser.parse(&bytes))
        });
        let doc = match parsed {
            Ok(doc) => doc,
            Err(e) => return self.fail_paper(paper, Stage::Parse, e),
        };

        self.store
            .put_parsed_text(paper.paper_id, &doc.text, doc.quality.as_str())?;
        self.commit_or_skip(TransitionRequest {
            paper_id: paper.paper_id,
            to_state: PaperState::Parsed,
            actor: "parse-worker".into(),
            observed_hash: self.hash.clone(),
            payload: serde_json::json!({
                "quality": doc.quality.as_str(),
                "chars": doc.text.len(),
            }),
        })
    }

    fn extract_one(&self, paper: &PaperRecord) -> Result<Processed, PipelineError> {
        let Some((text, _)) = self.store.parsed_text(paper.paper_id)? else {
            let err = RetryExhausted {
                attempts: 1,
                error: CapabilityError::Fatal("no parsed text for parsed paper".into()),
            };
            return self.fail_paper(paper, Stage::Extract, err);
        };

        let extracted = self.config.retry.run("extract", || {
            let extractor = Arc::clone(&self.caps.extractor);
            let text = text.clone();
            let schema = self.protocol.extraction.clone();
            self.config.retry.call_with_timeout(move || {
                let spans = extractor.extract(&text, &schema)?;
                conform_spans(&schema, spans)
            })
        });
        let spans = match extracted {
            Ok(spans) => spans,
            Err(e) => return self.fail_paper(paper, Stage::Extract, e),
        };

        let found = spans.iter().filter(|s| !s.is_not_found()).count();
        let outcome = self.commit_or_skip(TransitionRequest {
            paper_id: paper.paper_id,
            to_state: PaperState::Extracted,
            actor: "extract-worker".into(),
            observed_hash: self.hash.clone(),
            payload: serde_json::json!({
                "fields": spans.len(),
                "found": found,
            }),
        })?;
        // Evidence lands only once the transition is accepted; a refused
        // commit leaves previously recorded evidence untouched.
        if matches!(outcome, Processed::Advanced) {
            self.store.record_evidence(paper.paper_id, &spans)?;
        }
        Ok(outcome)
    }

    fn audit_one(&self, paper: &PaperRecord) -> Result<Processed, PipelineError> {
        let Some((text, _)) = self.store.parsed_text(paper.paper_id)? else {
            let err = RetryExhausted {
                attempts: 1,
                error: CapabilityError::Fatal("no parsed text for extracted paper".into()),
            };
            return self.fail_paper(paper, Stage::Audit, err);
        };
        let spans = self.store.evidence(paper.paper_id)?;
        if spans.is_empty() {
            let err = RetryExhausted {
                attempts: 1,
                error: CapabilityError::Fatal("no evidence recorded for extracted paper".into()),
            };
            return self.fail_paper(paper, Stage::Audit, err);
        }

        let audited = self.config.retry.run("audit", || {
            let judge = Arc::clone(&self.caps.judge);
            let rules = self.protocol.audit.clone();
            let text = text.clone();
            let spans = spans.clone();
            self.config.retry.call_with_timeout(move || {
                AuditCascade::new(rules).audit_paper(&text, &spans, judge.as_ref())
            })
        });
        let audit = match audited {
            Ok(audit) => audit,
            Err(e) => return self.fail_paper(paper, Stage::Audit, e),
        };

        let outcome = self.commit_or_skip(TransitionRequest {
            paper_id: paper.paper_id,
            to_state: PaperState::Audited,
            actor: "audit-worker".into(),
            observed_hash: self.hash.clone(),
            payload: serde_json::json!({
                "passed": audit.passed,
                "unverified_fields": audit.unverified_fields,
            }),
        })?;
        if matches!(outcome, Processed::Advanced) {
            self.store.record_audits(paper.paper_id, &audit.verdicts)?;
        }
        Ok(outcome)
    }

    /// Record a stage failure on the paper. The paper parks in `Failed`
    /// until an operator resets it; the run itself continues.
    fn fail_paper(
        &self,
        paper: &PaperRecord,
        stage: Stage,
        err: RetryExhausted,
    ) -> Result<Processed, PipelineError> {
        tracing::error!(paper = %paper.paper_id, %stage, %err, "Paper failed");
        let outcome = self.commit_or_skip(TransitionRequest {
            paper_id: paper.paper_id,
            to_state: PaperState::Failed(stage),
            actor: format!("{stage}-worker"),
            observed_hash: self.hash.clone(),
            payload: serde_json::json!({
                "error": err.error.to_string(),
                "attempts": err.attempts,
            }),
        })?;
        Ok(match outcome {
            Processed::Advanced => Processed::Failed,
            other => other,
        })
    }

    /// Per-paper commit problems (stale stamp, lost race with another
    /// worker) skip the paper; only store failures are structural.
    fn commit_or_skip(&self, req: TransitionRequest) -> Result<Processed, PipelineError> {
        let paper_id = req.paper_id;
        match self.machine.commit(req) {
            Ok(CommitOutcome::Applied) | Ok(CommitOutcome::AlreadyApplied) => {
                Ok(Processed::Advanced)
            }
            Err(TransitionError::StaleProtocol { scope }) => {
                tracing::warn!(paper = %paper_id, ?scope, "Commit refused, paper is stale");
                Ok(Processed::Skipped)
            }
            Err(err @ (TransitionError::Invalid { .. } | TransitionError::Conflict { .. })) => {
                tracing::warn!(paper = %paper_id, %err, "Commit refused");
                Ok(Processed::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }

    // ── Operator actions ─────────────────────────────────────

    /// Reset every failed paper back to its pre-failure state so the next
    /// run retries it.
    pub fn retry_failed(&self, actor: &str) -> Result<Vec<Uuid>, PipelineError> {
        let mut reset = Vec::new();
        for stage in [Stage::Screen, Stage::Parse, Stage::Extract, Stage::Audit] {
            for paper in self.store.papers_in_state(PaperState::Failed(stage))? {
                self.machine
                    .reset_failed(paper.paper_id, actor, "operator retry")?;
                reset.push(paper.paper_id);
            }
        }
        Ok(reset)
    }

    pub fn flagged(&self) -> Result<Vec<PaperRecord>, PipelineError> {
        Ok(self.store.papers_in_state(PaperState::ScreenFlagged)?)
    }

    pub fn resolve_flagged(
        &self,
        paper_id: Uuid,
        include: bool,
        actor: &str,
        rationale: &str,
    ) -> Result<(), PipelineError> {
        self.machine
            .resolve_flagged(paper_id, include, actor, rationale)?;
        Ok(())
    }

    /// Papers whose last stamp predates the live protocol, with scope.
    pub fn stale_report(&self) -> Result<Vec<(Uuid, StaleScope)>, PipelineError> {
        Ok(self.store.stale_papers(&self.hash)?)
    }

    pub fn reset_stale(&self, paper_id: Uuid, actor: &str) -> Result<PaperState, PipelineError> {
        Ok(self.machine.reset_stale(paper_id, actor)?)
    }

    pub fn pipeline_stats(&self) -> Result<crate::state::PipelineStats, PipelineError> {
        Ok(self.store.pipeline_stats()?)
    }
}

/// Align extractor output with the schema: reject unknown or duplicate
/// fields as malformed (retryable), fill unreported fields with the
/// NOT_FOUND sentinel, and require at least one tier-1 value.
fn conform_spans(
    schema: &ExtractionSchema,
    spans: Vec<EvidenceSpan>,
) -> Result<Vec<EvidenceSpan>, CapabilityError> {
    let mut by_name: HashMap<&str, EvidenceSpan> = HashMap::new();
    for span in &spans {
        if schema.field(&span.field_name).is_none() {
            return Err(CapabilityError::Malformed(format!(
                "extractor returned unknown field '{}'",
                span.field_name
            )));
        }
        if by_name.insert(span.field_name.as_str(), span.clone()).is_some() {
            return Err(CapabilityError::Malformed(format!(
                "extractor returned field '{}' twice",
                span.field_name
            )));
        }
    }

    let conformed: Vec<EvidenceSpan> = schema
        .fields
        .iter()
        .map(|field| {
            by_name.remove(field.name.as_str()).unwrap_or(EvidenceSpan {
                field_name: field.name.clone(),
                value: NOT_FOUND.into(),
                source_snippet: String::new(),
                location: None,
            })
        })
        .collect();

    let tier1_found = conformed.iter().any(|s| {
        !s.is_not_found()
            && schema
                .field(&s.field_name)
                .is_some_and(|f| f.tier == 1)
    });
    if !tier1_found {
        return Err(CapabilityError::Malformed(
            "no tier-1 field extracted".into(),
        ));
    }
    Ok(conformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExtractionField;

    fn schema() -> ExtractionSchema {
        ExtractionSchema {
            fields: vec![
                ExtractionField {
                    name: "sample_size".into(),
                    field_type: "int".into(),
                    description: "Total randomized".into(),
                    tier: 1,
                    enum_values: None,
                },
                ExtractionField {
                    name: "blinding".into(),
                    field_type: "str".into(),
                    description: "Blinding design".into(),
                    tier: 2,
                    enum_values: None,
                },
            ],
        }
    }

    fn span(field: &str, value: &str) -> EvidenceSpan {
        EvidenceSpan {
            field_name: field.into(),
            value: value.into(),
            source_snippet: format!("the {field} was {value}"),
            location: None,
        }
    }

    #[test]
    fn conform_fills_missing_fields_with_not_found() {
        let spans = conform_spans(&schema(), vec![span("sample_size", "120")]).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].field_name, "sample_size");
        assert_eq!(spans[1].field_name, "blinding");
        assert!(spans[1].is_not_found());
    }

    #[test]
    fn conform_rejects_unknown_field() {
        let err = conform_spans(&schema(), vec![span("sample_size", "120"), span("bogus", "x")])
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));
    }

    #[test]
    fn conform_rejects_duplicate_field() {
        let err = conform_spans(
            &schema(),
            vec![span("sample_size", "120"), span("sample_size", "121")],
        )
        .unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));
    }

    #[test]
    fn conform_requires_a_tier1_value() {
        let err = conform_spans(&schema(), vec![span("blinding", "double")]).unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));

        let mut nf = span("sample_size", NOT_FOUND);
        nf.source_snippet.clear();
        let err = conform_spans(&schema(), vec![nf, span("blinding", "double")]).unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));
    }
}
