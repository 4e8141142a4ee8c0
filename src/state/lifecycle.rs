//! Paper lifecycle: states, the legality graph, and transition records.
//!
//! The transition log is the sole source of truth; a paper's current state
//! is always the `to_state` of its last transition. The log is append-only
//! and never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ProtocolHash;

/// The pipeline stage that performs a unit of work on a paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Screen,
    Parse,
    Extract,
    Audit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screen => "screen",
            Self::Parse => "parse",
            Self::Extract => "extract",
            Self::Audit => "audit",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screen" => Ok(Self::Screen),
            "parse" => Ok(Self::Parse),
            "extract" => Ok(Self::Extract),
            "audit" => Ok(Self::Audit),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative per-paper lifecycle state.
///
/// `Failed` is a pseudo-state: it blocks forward progress until an explicit
/// reset, and the state it interrupted is recoverable from the transition
/// log (the `from_state` of the failing transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaperState {
    Ingested,
    ScreenedIn,
    ScreenedOut,
    ScreenFlagged,
    PdfAcquired,
    Parsed,
    Extracted,
    Audited,
    Failed(Stage),
}

/// Which protocol-hash sections a transition target depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashGate {
    /// No dependency on screening or extraction rules.
    Independent,
    /// Depends on the screening criteria section only.
    Screening,
    /// Depends on both sections (anything at or past extraction).
    Full,
}

impl PaperState {
    /// Declared successors in the lifecycle graph. `ScreenFlagged` is
    /// terminal for the default pipeline but resolvable by an explicit
    /// elevated decision, hence its screening successors.
    pub fn successors(&self) -> &'static [PaperState] {
        match self {
            Self::Ingested => &[Self::ScreenedIn, Self::ScreenedOut, Self::ScreenFlagged],
            Self::ScreenedIn => &[Self::PdfAcquired],
            Self::ScreenFlagged => &[Self::ScreenedIn, Self::ScreenedOut],
            Self::PdfAcquired => &[Self::Parsed],
            Self::Parsed => &[Self::Extracted],
            Self::Extracted => &[Self::Audited],
            Self::ScreenedOut | Self::Audited | Self::Failed(_) => &[],
        }
    }

    /// The stage whose worker is responsible for moving a paper out of this
    /// state, if any.
    pub fn pending_stage(&self) -> Option<Stage> {
        match self {
            Self::Ingested => Some(Stage::Screen),
            Self::PdfAcquired => Some(Stage::Parse),
            Self::Parsed => Some(Stage::Extract),
            Self::Extracted => Some(Stage::Audit),
            _ => None,
        }
    }

    /// A transition is legal if the target is a declared successor, or a
    /// failure marker for the stage that was processing this state.
    pub fn can_transition_to(&self, target: PaperState) -> bool {
        if self.successors().contains(&target) {
            return true;
        }
        matches!((self.pending_stage(), target), (Some(stage), PaperState::Failed(failed)) if stage == failed)
    }

    /// Hash sections the target state depends on. PDF acquisition and
    /// parsing have no dependency on screening/extraction rules; failure
    /// markers must be recordable even under a stale protocol.
    pub fn hash_gate(&self) -> HashGate {
        match self {
            Self::ScreenedIn | Self::ScreenedOut | Self::ScreenFlagged => HashGate::Screening,
            Self::Extracted | Self::Audited => HashGate::Full,
            Self::Ingested | Self::PdfAcquired | Self::Parsed | Self::Failed(_) => {
                HashGate::Independent
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty() && !matches!(self, Self::Failed(_))
    }

    /// Stable string form used in the store and in logs.
    pub fn encode(&self) -> String {
        match self {
            Self::Ingested => "INGESTED".into(),
            Self::ScreenedIn => "SCREENED_IN".into(),
            Self::ScreenedOut => "SCREENED_OUT".into(),
            Self::ScreenFlagged => "SCREEN_FLAGGED".into(),
            Self::PdfAcquired => "PDF_ACQUIRED".into(),
            Self::Parsed => "PARSED".into(),
            Self::Extracted => "EXTRACTED".into(),
            Self::Audited => "AUDITED".into(),
            Self::Failed(stage) => format!("FAILED({stage})"),
        }
    }

    pub fn decode(s: &str) -> Result<Self, String> {
        match s {
            "INGESTED" => Ok(Self::Ingested),
            "SCREENED_IN" => Ok(Self::ScreenedIn),
            "SCREENED_OUT" => Ok(Self::ScreenedOut),
            "SCREEN_FLAGGED" => Ok(Self::ScreenFlagged),
            "PDF_ACQUIRED" => Ok(Self::PdfAcquired),
            "PARSED" => Ok(Self::Parsed),
            "EXTRACTED" => Ok(Self::Extracted),
            "AUDITED" => Ok(Self::Audited),
            other => {
                let stage = other
                    .strip_prefix("FAILED(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown paper state '{other}'"))?;
                Ok(Self::Failed(stage.parse()?))
            }
        }
    }
}

impl std::fmt::Display for PaperState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One appended entry in a paper's transition log. `from_state` is `None`
/// only for the genesis entry written at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub seq: i64,
    pub paper_id: Uuid,
    pub from_state: Option<PaperState>,
    pub to_state: PaperState,
    pub actor: String,
    pub observed_hash: ProtocolHash,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// A transition a stage worker wants committed.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub paper_id: Uuid,
    pub to_state: PaperState,
    pub actor: String,
    pub observed_hash: ProtocolHash,
    pub payload: serde_json::Value,
}
