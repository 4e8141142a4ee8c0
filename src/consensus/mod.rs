//! Consensus rules: dual-pass screening agreement and the extraction audit
//! cascade. Disagreement is never averaged away; it is surfaced.

pub mod audit;

use serde::{Deserialize, Serialize};

use crate::state::PaperState;

pub use audit::{AuditCascade, PaperAudit};

/// One screening pass's verdict on a citation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningVerdict {
    Include,
    Exclude,
}

/// Full output of a single screening pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningDecision {
    pub verdict: ScreeningVerdict,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Resolved outcome of two independent screening passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningConsensus {
    pub pass1: ScreeningDecision,
    pub pass2: ScreeningDecision,
    pub agreement: bool,
    pub outcome: PaperState,
}

/// Dual-pass resolution. Both passes must agree for a definitive screening
/// state; any disagreement flags the paper for elevated review.
pub fn resolve(pass1: ScreeningDecision, pass2: ScreeningDecision) -> ScreeningConsensus {
    use ScreeningVerdict::*;
    let (agreement, outcome) = match (pass1.verdict, pass2.verdict) {
        (Include, Include) => (true, PaperState::ScreenedIn),
        (Exclude, Exclude) => (true, PaperState::ScreenedOut),
        (Include, Exclude) | (Exclude, Include) => (false, PaperState::ScreenFlagged),
    };
    ScreeningConsensus {
        pass1,
        pass2,
        agreement,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(verdict: ScreeningVerdict) -> ScreeningDecision {
        ScreeningDecision {
            verdict,
            rationale: "test".into(),
            confidence: Some(0.9),
        }
    }

    #[test]
    fn agreement_yields_definitive_states() {
        use ScreeningVerdict::*;
        let c = resolve(decide(Include), decide(Include));
        assert!(c.agreement);
        assert_eq!(c.outcome, PaperState::ScreenedIn);

        let c = resolve(decide(Exclude), decide(Exclude));
        assert!(c.agreement);
        assert_eq!(c.outcome, PaperState::ScreenedOut);
    }

    #[test]
    fn disagreement_flags_regardless_of_order() {
        use ScreeningVerdict::*;
        for (a, b) in [(Include, Exclude), (Exclude, Include)] {
            let c = resolve(decide(a), decide(b));
            assert!(!c.agreement);
            assert_eq!(c.outcome, PaperState::ScreenFlagged);
        }
    }

    #[test]
    fn consensus_preserves_both_rationales() {
        use ScreeningVerdict::*;
        let mut p1 = decide(Include);
        p1.rationale = "meets population criterion".into();
        let mut p2 = decide(Exclude);
        p2.rationale = "wrong study design".into();
        let c = resolve(p1, p2);
        assert_eq!(c.pass1.rationale, "meets population criterion");
        assert_eq!(c.pass2.rationale, "wrong study design");
    }
}
