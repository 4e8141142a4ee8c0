//! Transition commit path: legality, hash gating, idempotent replay, and
//! the explicit recovery operations (failure reset, flag resolution, stale
//! rollback).
//!
//! All commits for one paper are serialized behind a per-paper lock, so the
//! read-check-append sequence is atomic with respect to concurrent stage
//! workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use super::lifecycle::{HashGate, PaperState, StateTransition, TransitionRequest};
use super::store::{ReviewStore, StoreError};
use crate::protocol::{ProtocolHash, StaleScope};

/// Why a transition request was refused.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Invalid { from: PaperState, to: PaperState },

    #[error("protocol changed since this work was stamped ({scope:?})")]
    StaleProtocol { scope: StaleScope },

    #[error("conflicting duplicate commit for paper {paper_id} -> {to}")]
    Conflict { paper_id: Uuid, to: PaperState },

    #[error("paper {0} is not in a failed state")]
    NotFailed(Uuid),

    #[error("paper {0} is not flagged for screening review")]
    NotFlagged(Uuid),

    #[error("paper {0} is not stale under the live protocol")]
    NotStale(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a commit attempt that was not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The exact same transition was already committed; the replay is a
    /// harmless no-op and the log gains no entry.
    AlreadyApplied,
}

/// Serializes commits per paper without blocking unrelated papers.
#[derive(Default)]
struct PaperLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PaperLocks {
    fn lock_for(&self, paper_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(paper_id).or_default().clone()
    }
}

/// The only writer of lifecycle transitions. Stage workers and recovery
/// operations all commit through here.
pub struct LifecycleMachine {
    store: Arc<ReviewStore>,
    live_hash: ProtocolHash,
    locks: PaperLocks,
}

impl LifecycleMachine {
    pub fn new(store: Arc<ReviewStore>, live_hash: ProtocolHash) -> Self {
        Self {
            store,
            live_hash,
            locks: PaperLocks::default(),
        }
    }

    pub fn live_hash(&self) -> &ProtocolHash {
        &self.live_hash
    }

    pub fn store(&self) -> &Arc<ReviewStore> {
        &self.store
    }

    /// Commit a stage worker's transition.
    ///
    /// Checks, in order: idempotent replay, graph legality, hash gating
    /// against both the worker's observed hash and the stamp on the paper's
    /// last transition. Only then is the entry appended.
    pub fn commit(&self, req: TransitionRequest) -> Result<CommitOutcome, TransitionError> {
        let lock = self.locks.lock_for(req.paper_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let last = self.store.last_transition(req.paper_id)?;
        let current = last.to_state;

        if current == req.to_state {
            return self.replay_outcome(&last, &req);
        }

        if !current.can_transition_to(req.to_state) {
            return Err(TransitionError::Invalid {
                from: current,
                to: req.to_state,
            });
        }

        let gate = req.to_state.hash_gate();
        if let Some(scope) = gate_violation(gate, &self.live_hash, &req.observed_hash) {
            return Err(TransitionError::StaleProtocol { scope });
        }
        // A current observation does not help if the work this transition
        // builds on was stamped under an older protocol.
        if let Some(scope) = gate_violation(gate, &self.live_hash, &last.observed_hash) {
            return Err(TransitionError::StaleProtocol { scope });
        }

        self.store.append_transition(Some(current), &req)?;
        tracing::debug!(
            paper = %req.paper_id,
            from = %current,
            to = %req.to_state,
            actor = %req.actor,
            "Transition committed"
        );
        Ok(CommitOutcome::Applied)
    }

    /// Whether the stamp on a paper's last transition would block a commit
    /// to `target` under the live protocol. Stage workers consult this
    /// before spending a capability call; `commit` enforces the same check
    /// again under the paper lock.
    pub fn stamp_staleness(
        &self,
        paper_id: Uuid,
        target: PaperState,
    ) -> Result<Option<StaleScope>, TransitionError> {
        let last = self.store.last_transition(paper_id)?;
        Ok(gate_violation(
            target.hash_gate(),
            &self.live_hash,
            &last.observed_hash,
        ))
    }

    fn replay_outcome(
        &self,
        last: &StateTransition,
        req: &TransitionRequest,
    ) -> Result<CommitOutcome, TransitionError> {
        if last.actor == req.actor && last.payload == req.payload {
            tracing::debug!(paper = %req.paper_id, to = %req.to_state, "Duplicate commit ignored");
            Ok(CommitOutcome::AlreadyApplied)
        } else {
            Err(TransitionError::Conflict {
                paper_id: req.paper_id,
                to: req.to_state,
            })
        }
    }

    /// Move a failed paper back to the state it held before the failure so
    /// its stage can be retried. The prior state comes from the failing
    /// transition's own `from_state`, bypassing the forward graph.
    pub fn reset_failed(
        &self,
        paper_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> Result<PaperState, TransitionError> {
        let lock = self.locks.lock_for(paper_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let last = self.store.last_transition(paper_id)?;
        let PaperState::Failed(stage) = last.to_state else {
            return Err(TransitionError::NotFailed(paper_id));
        };
        let prior = last.from_state.ok_or_else(|| {
            StoreError::Corrupted(format!("failed genesis transition for paper {paper_id}"))
        })?;

        self.store.append_transition(
            Some(last.to_state),
            &TransitionRequest {
                paper_id,
                to_state: prior,
                actor: actor.to_string(),
                observed_hash: self.live_hash.clone(),
                payload: serde_json::json!({
                    "reset_reason": reason,
                    "failed_stage": stage.as_str(),
                }),
            },
        )?;
        tracing::info!(paper = %paper_id, %stage, back_to = %prior, "Failure reset");
        Ok(prior)
    }

    /// Resolve a screening disagreement with an explicit elevated decision.
    /// Goes through the normal commit path, so hash gating applies.
    pub fn resolve_flagged(
        &self,
        paper_id: Uuid,
        include: bool,
        actor: &str,
        rationale: &str,
    ) -> Result<CommitOutcome, TransitionError> {
        let current = self.store.current_state(paper_id)?;
        if current != PaperState::ScreenFlagged {
            return Err(TransitionError::NotFlagged(paper_id));
        }
        let to_state = if include {
            PaperState::ScreenedIn
        } else {
            PaperState::ScreenedOut
        };
        self.commit(TransitionRequest {
            paper_id,
            to_state,
            actor: actor.to_string(),
            observed_hash: self.live_hash.clone(),
            payload: serde_json::json!({
                "resolution": "flag_override",
                "rationale": rationale,
            }),
        })
    }

    /// Roll a stale paper back to the earliest state whose work the
    /// protocol change invalidated. Screening-scope changes restart from
    /// `Ingested`; extraction-scope changes return extracted or audited
    /// papers to `Parsed` and leave earlier states untouched.
    ///
    /// When the stale stamp invalidates no recorded work (the paper never
    /// got past the point the change affects), the reset re-stamps the
    /// current state instead, so gated commits stop refusing it.
    pub fn reset_stale(&self, paper_id: Uuid, actor: &str) -> Result<PaperState, TransitionError> {
        let lock = self.locks.lock_for(paper_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let last = self.store.last_transition(paper_id)?;
        let current = last.to_state;
        if let PaperState::Failed(_) = current {
            return Err(TransitionError::NotFailed(paper_id));
        }
        let Some(scope) = self.live_hash.staleness(&last.observed_hash) else {
            return Err(TransitionError::NotStale(paper_id));
        };

        let target = match scope {
            StaleScope::FromScreening => PaperState::Ingested,
            StaleScope::FromExtraction => match current {
                PaperState::Extracted | PaperState::Audited => PaperState::Parsed,
                // Parse output does not depend on the schema section; only
                // the stamp is stale, so a re-stamp unblocks extraction.
                PaperState::Parsed => PaperState::Parsed,
                _ => return Err(TransitionError::NotStale(paper_id)),
            },
        };

        self.store.append_transition(
            Some(current),
            &TransitionRequest {
                paper_id,
                to_state: target,
                actor: actor.to_string(),
                observed_hash: self.live_hash.clone(),
                payload: serde_json::json!({
                    "reset_reason": "protocol_changed",
                    "scope": format!("{scope:?}"),
                }),
            },
        )?;
        tracing::info!(paper = %paper_id, ?scope, back_to = %target, "Stale rollback");
        Ok(target)
    }
}

fn gate_violation(gate: HashGate, live: &ProtocolHash, observed: &ProtocolHash) -> Option<StaleScope> {
    let scope = live.staleness(observed)?;
    match gate {
        HashGate::Independent => None,
        HashGate::Screening => (scope == StaleScope::FromScreening).then_some(scope),
        HashGate::Full => Some(scope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Citation;
    use crate::state::lifecycle::Stage;

    fn hash() -> ProtocolHash {
        ProtocolHash {
            screening: "s".repeat(64),
            extraction: "e".repeat(64),
        }
    }

    fn machine() -> (LifecycleMachine, Uuid) {
        let store = Arc::new(ReviewStore::open_in_memory().unwrap());
        let citation = Citation {
            title: "A study".into(),
            ..Default::default()
        };
        let id = store
            .register_paper(&citation, &hash(), serde_json::json!({}))
            .unwrap();
        (LifecycleMachine::new(store, hash()), id)
    }

    fn req(paper_id: Uuid, to: PaperState) -> TransitionRequest {
        TransitionRequest {
            paper_id,
            to_state: to,
            actor: "screen-worker".into(),
            observed_hash: hash(),
            payload: serde_json::json!({"verdict": "include"}),
        }
    }

    #[test]
    fn legal_commit_applies() {
        let (m, id) = machine();
        let outcome = m.commit(req(id, PaperState::ScreenedIn)).unwrap();
        assert_eq!(outcome, CommitOutcome::Applied);
        assert_eq!(m.store().current_state(id).unwrap(), PaperState::ScreenedIn);
    }

    #[test]
    fn illegal_commit_rejected_without_log_entry() {
        let (m, id) = machine();
        let err = m.commit(req(id, PaperState::Extracted)).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Invalid {
                from: PaperState::Ingested,
                to: PaperState::Extracted
            }
        ));
        assert_eq!(m.store().history(id).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_commit_is_noop() {
        let (m, id) = machine();
        m.commit(req(id, PaperState::ScreenedIn)).unwrap();
        let before = m.store().history(id).unwrap().len();

        let outcome = m.commit(req(id, PaperState::ScreenedIn)).unwrap();
        assert_eq!(outcome, CommitOutcome::AlreadyApplied);
        assert_eq!(m.store().history(id).unwrap().len(), before);
    }

    #[test]
    fn conflicting_duplicate_is_an_error() {
        let (m, id) = machine();
        m.commit(req(id, PaperState::ScreenedIn)).unwrap();

        let mut conflicting = req(id, PaperState::ScreenedIn);
        conflicting.payload = serde_json::json!({"verdict": "include", "note": "different"});
        let err = m.commit(conflicting).unwrap_err();
        assert!(matches!(err, TransitionError::Conflict { .. }));
    }

    #[test]
    fn stale_observed_hash_blocks_gated_commit() {
        let (m, id) = machine();
        let mut stale = req(id, PaperState::ScreenedIn);
        stale.observed_hash.screening = "z".repeat(64);
        let err = m.commit(stale).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::StaleProtocol {
                scope: StaleScope::FromScreening
            }
        ));
    }

    #[test]
    fn extraction_change_does_not_block_screening_commit() {
        let (m, id) = machine();
        let mut observed = req(id, PaperState::ScreenedIn);
        observed.observed_hash.extraction = "z".repeat(64);
        // Screening gate only cares about the screening section.
        assert_eq!(m.commit(observed).unwrap(), CommitOutcome::Applied);
    }

    #[test]
    fn independent_commit_ignores_hash_entirely() {
        let (m, id) = machine();
        m.commit(req(id, PaperState::ScreenedIn)).unwrap();

        let mut r = req(id, PaperState::PdfAcquired);
        r.observed_hash = ProtocolHash {
            screening: "z".repeat(64),
            extraction: "z".repeat(64),
        };
        assert_eq!(m.commit(r).unwrap(), CommitOutcome::Applied);
    }

    #[test]
    fn stale_prior_stamp_blocks_dependent_commit() {
        let store = Arc::new(ReviewStore::open_in_memory().unwrap());
        let old = ProtocolHash {
            screening: "s".repeat(64),
            extraction: "o".repeat(64),
        };
        let citation = Citation {
            title: "A study".into(),
            ..Default::default()
        };
        let id = store.register_paper(&citation, &old, serde_json::json!({})).unwrap();

        // Walk the paper to Extracted under the old protocol.
        let mut m = LifecycleMachine::new(store.clone(), old.clone());
        for to in [
            PaperState::ScreenedIn,
            PaperState::PdfAcquired,
            PaperState::Parsed,
            PaperState::Extracted,
        ] {
            let mut r = req(id, to);
            r.observed_hash = old.clone();
            m.commit(r).unwrap();
        }

        // Extraction rules change; the audit commit must refuse even though
        // the worker observes the new hash.
        m = LifecycleMachine::new(store, hash());
        let r = req(id, PaperState::Audited);
        let err = m.commit(r).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::StaleProtocol {
                scope: StaleScope::FromExtraction
            }
        ));

        // The pre-check a worker runs before dispatch agrees with the gate.
        assert_eq!(
            m.stamp_staleness(id, PaperState::Audited).unwrap(),
            Some(StaleScope::FromExtraction)
        );
        assert_eq!(m.stamp_staleness(id, PaperState::Parsed).unwrap(), None);
    }

    #[test]
    fn failure_reset_restores_prior_state() {
        let (m, id) = machine();
        m.commit(req(id, PaperState::Failed(Stage::Screen))).unwrap();

        let prior = m.reset_failed(id, "operator", "llm quota restored").unwrap();
        assert_eq!(prior, PaperState::Ingested);
        assert_eq!(m.store().current_state(id).unwrap(), PaperState::Ingested);

        // The failure stays in the log.
        let history = m.store().history(id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].to_state, PaperState::Failed(Stage::Screen));
    }

    #[test]
    fn reset_of_healthy_paper_refused() {
        let (m, id) = machine();
        let err = m.reset_failed(id, "operator", "oops").unwrap_err();
        assert!(matches!(err, TransitionError::NotFailed(_)));
    }

    #[test]
    fn flag_resolution() {
        let (m, id) = machine();
        let mut r = req(id, PaperState::ScreenFlagged);
        r.payload = serde_json::json!({"pass1": "include", "pass2": "exclude"});
        m.commit(r).unwrap();

        let err = m
            .resolve_flagged(Uuid::new_v4(), true, "reviewer", "x")
            .unwrap_err();
        assert!(matches!(err, TransitionError::Store(StoreError::PaperNotFound(_))));

        m.resolve_flagged(id, true, "reviewer", "meets criterion 2").unwrap();
        assert_eq!(m.store().current_state(id).unwrap(), PaperState::ScreenedIn);

        let err = m.resolve_flagged(id, false, "reviewer", "again").unwrap_err();
        assert!(matches!(err, TransitionError::NotFlagged(_)));
    }

    #[test]
    fn screening_scope_rollback_restarts_from_ingested() {
        let store = Arc::new(ReviewStore::open_in_memory().unwrap());
        let old = hash();
        let citation = Citation {
            title: "A study".into(),
            ..Default::default()
        };
        let id = store.register_paper(&citation, &old, serde_json::json!({})).unwrap();
        let m = LifecycleMachine::new(store.clone(), old.clone());
        m.commit(req(id, PaperState::ScreenedOut)).unwrap();

        let live = ProtocolHash {
            screening: "n".repeat(64),
            extraction: old.extraction.clone(),
        };
        let m = LifecycleMachine::new(store, live);
        let back = m.reset_stale(id, "operator").unwrap();
        assert_eq!(back, PaperState::Ingested);
    }

    #[test]
    fn extraction_scope_rollback_only_past_parsed() {
        let store = Arc::new(ReviewStore::open_in_memory().unwrap());
        let old = hash();
        let citation = Citation {
            title: "A study".into(),
            ..Default::default()
        };
        let id = store.register_paper(&citation, &old, serde_json::json!({})).unwrap();
        let m = LifecycleMachine::new(store.clone(), old.clone());
        for to in [
            PaperState::ScreenedIn,
            PaperState::PdfAcquired,
            PaperState::Parsed,
            PaperState::Extracted,
        ] {
            m.commit(req(id, to)).unwrap();
        }

        let live = ProtocolHash {
            screening: old.screening.clone(),
            extraction: "n".repeat(64),
        };
        let m = LifecycleMachine::new(store.clone(), live.clone());
        assert_eq!(m.reset_stale(id, "operator").unwrap(), PaperState::Parsed);

        // A paper still parked before extraction is not considered stale
        // under an extraction-only change.
        let other = store
            .register_paper(&citation, &old, serde_json::json!({}))
            .unwrap();
        let err = m.reset_stale(other, "operator").unwrap_err();
        assert!(matches!(err, TransitionError::NotStale(_)));
    }

    #[test]
    fn stale_stamp_without_invalidated_work_is_restamped_in_place() {
        let store = Arc::new(ReviewStore::open_in_memory().unwrap());
        let old = hash();
        let citation = Citation {
            title: "A study".into(),
            ..Default::default()
        };
        let id = store.register_paper(&citation, &old, serde_json::json!({})).unwrap();
        let m = LifecycleMachine::new(store.clone(), old.clone());
        for to in [PaperState::ScreenedIn, PaperState::PdfAcquired, PaperState::Parsed] {
            m.commit(req(id, to)).unwrap();
        }

        // Schema edit while the paper sits at Parsed: the parse output is
        // still valid, but the stamp blocks the extraction commit.
        let live = ProtocolHash {
            screening: old.screening.clone(),
            extraction: "n".repeat(64),
        };
        let m = LifecycleMachine::new(store.clone(), live.clone());
        assert_eq!(
            m.stamp_staleness(id, PaperState::Extracted).unwrap(),
            Some(StaleScope::FromExtraction)
        );

        assert_eq!(m.reset_stale(id, "operator").unwrap(), PaperState::Parsed);
        let last = store.last_transition(id).unwrap();
        assert_eq!(last.from_state, Some(PaperState::Parsed));
        assert_eq!(last.to_state, PaperState::Parsed);
        assert_eq!(last.observed_hash, live);
        assert_eq!(m.stamp_staleness(id, PaperState::Extracted).unwrap(), None);
    }
}
