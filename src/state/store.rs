//! Per-review SQLite store: papers, the append-only transition log,
//! documents, evidence spans, audit verdicts, dedup stats, and run records.
//!
//! One database file per review under the data root gives full isolation
//! between concurrently running reviews. The store is an explicit object
//! passed to components, never a process-wide singleton.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lifecycle::{PaperState, StateTransition, TransitionRequest};
use super::record::{AuditVerdict, EvidenceSpan, PaperRecord, VerifyMethod};
use crate::protocol::{ProtocolHash, StaleScope};
use crate::search::{Citation, DedupStats};

/// Structural store failures. These abort the review run; per-paper errors
/// never surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Paper not found: {0}")]
    PaperNotFound(Uuid),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER NOT NULL
);
INSERT INTO schema_version (version) VALUES (1);

CREATE TABLE IF NOT EXISTS papers (
    id          TEXT PRIMARY KEY,
    citation    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transitions (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    paper_id        TEXT NOT NULL REFERENCES papers(id),
    from_state      TEXT,
    to_state        TEXT NOT NULL,
    actor           TEXT NOT NULL,
    screening_hash  TEXT NOT NULL,
    extraction_hash TEXT NOT NULL,
    payload         TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transitions_paper ON transitions(paper_id);

CREATE TABLE IF NOT EXISTS documents (
    paper_id        TEXT PRIMARY KEY REFERENCES papers(id),
    pdf             BLOB,
    parsed_text     TEXT,
    parse_quality   TEXT
);

CREATE TABLE IF NOT EXISTS evidence_spans (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    paper_id        TEXT NOT NULL REFERENCES papers(id),
    field_name      TEXT NOT NULL,
    value           TEXT NOT NULL,
    source_snippet  TEXT NOT NULL,
    location        TEXT,
    UNIQUE (paper_id, field_name)
);

CREATE TABLE IF NOT EXISTS audit_verdicts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    paper_id        TEXT NOT NULL REFERENCES papers(id),
    field_name      TEXT NOT NULL,
    verified        INTEGER NOT NULL,
    method          TEXT,
    detail          TEXT,
    UNIQUE (paper_id, field_name)
);

CREATE TABLE IF NOT EXISTS dedup_stats (
    id              INTEGER PRIMARY KEY CHECK (id = 1),
    input           INTEGER NOT NULL,
    rejected        INTEGER NOT NULL,
    exact_merged    INTEGER NOT NULL,
    fuzzy_merged    INTEGER NOT NULL,
    unique_count    INTEGER NOT NULL,
    recorded_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS review_runs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    screening_hash  TEXT NOT NULL,
    extraction_hash TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    completed_at    TEXT,
    status          TEXT NOT NULL DEFAULT 'running'
                    CHECK (status IN ('running', 'completed', 'failed'))
);
";

/// Review-run outcome recorded in `review_runs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Full-pipeline counts for audit trails and resumption decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total_papers: i64,
    pub by_state: BTreeMap<String, i64>,
    pub spans_total: i64,
    pub spans_verified: i64,
    pub spans_flagged: i64,
}

/// SQLite-backed state for a single review.
pub struct ReviewStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ReviewStore {
    /// Open (or create) the store for one review under `root`.
    pub fn open(root: &Path, review_name: &str) -> Result<Self, StoreError> {
        let dir = root.join(review_name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("review.db");
        let conn = Connection::open(&path)?;
        configure(&conn)?;
        run_migrations(&conn)?;
        tracing::info!(db = %path.display(), "Review store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Papers ───────────────────────────────────────────────

    /// Register a deduplicated seed as a new paper in state `Ingested`,
    /// stamped with the live protocol hash via a genesis transition.
    pub fn register_paper(
        &self,
        citation: &Citation,
        hash: &ProtocolHash,
        payload: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let blob = serde_json::to_string(citation)
            .map_err(|e| StoreError::Corrupted(format!("citation encode: {e}")))?;
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO papers (id, citation, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), blob, now],
        )?;
        conn.execute(
            "INSERT INTO transitions
             (paper_id, from_state, to_state, actor, screening_hash, extraction_hash, payload, created_at)
             VALUES (?1, NULL, ?2, 'ingest', ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                PaperState::Ingested.encode(),
                hash.screening,
                hash.extraction,
                payload.to_string(),
                now,
            ],
        )?;
        Ok(id)
    }

    pub fn has_papers(&self) -> Result<bool, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn paper(&self, paper_id: Uuid) -> Result<PaperRecord, StoreError> {
        let citation: Option<String> = self
            .conn()
            .query_row(
                "SELECT citation FROM papers WHERE id = ?1",
                params![paper_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let blob = citation.ok_or(StoreError::PaperNotFound(paper_id))?;
        let citation = serde_json::from_str(&blob)
            .map_err(|e| StoreError::Corrupted(format!("citation decode: {e}")))?;
        let state = self.current_state(paper_id)?;
        Ok(PaperRecord {
            paper_id,
            citation,
            state,
        })
    }

    /// Papers whose projected current state equals `state`, in registration
    /// order.
    pub fn papers_in_state(&self, state: PaperState) -> Result<Vec<PaperRecord>, StoreError> {
        let rows: Vec<(String, String)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT p.id, p.citation
                 FROM papers p
                 JOIN transitions t ON t.paper_id = p.id
                 WHERE t.seq = (SELECT MAX(t2.seq) FROM transitions t2 WHERE t2.paper_id = p.id)
                   AND t.to_state = ?1
                 ORDER BY p.rowid",
            )?;
            let mapped = stmt.query_map(params![state.encode()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut records = Vec::with_capacity(rows.len());
        for (id, blob) in rows {
            let paper_id = parse_uuid(&id)?;
            let citation = serde_json::from_str(&blob)
                .map_err(|e| StoreError::Corrupted(format!("citation decode: {e}")))?;
            records.push(PaperRecord {
                paper_id,
                citation,
                state,
            });
        }
        Ok(records)
    }

    // ── Transition log ───────────────────────────────────────

    /// Current state is a projection: the last transition's `to_state`.
    pub fn current_state(&self, paper_id: Uuid) -> Result<PaperState, StoreError> {
        Ok(self.last_transition(paper_id)?.to_state)
    }

    pub fn last_transition(&self, paper_id: Uuid) -> Result<StateTransition, StoreError> {
        let row = self.query_transitions(
            "SELECT seq, paper_id, from_state, to_state, actor, screening_hash,
                    extraction_hash, payload, created_at
             FROM transitions WHERE paper_id = ?1 ORDER BY seq DESC LIMIT 1",
            paper_id,
        )?;
        row.into_iter()
            .next()
            .ok_or(StoreError::PaperNotFound(paper_id))
    }

    /// Full append-only history, oldest first.
    pub fn history(&self, paper_id: Uuid) -> Result<Vec<StateTransition>, StoreError> {
        self.query_transitions(
            "SELECT seq, paper_id, from_state, to_state, actor, screening_hash,
                    extraction_hash, payload, created_at
             FROM transitions WHERE paper_id = ?1 ORDER BY seq ASC",
            paper_id,
        )
    }

    /// Append a transition entry. Callers (the lifecycle machine) are
    /// responsible for legality and hash checks; the store only appends.
    pub fn append_transition(
        &self,
        from_state: Option<PaperState>,
        req: &TransitionRequest,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO transitions
             (paper_id, from_state, to_state, actor, screening_hash, extraction_hash, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                req.paper_id.to_string(),
                from_state.map(|s| s.encode()),
                req.to_state.encode(),
                req.actor,
                req.observed_hash.screening,
                req.observed_hash.extraction,
                req.payload.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    fn query_transitions(
        &self,
        sql: &str,
        paper_id: Uuid,
    ) -> Result<Vec<StateTransition>, StoreError> {
        type Row = (
            i64,
            String,
            Option<String>,
            String,
            String,
            String,
            String,
            String,
            DateTime<Utc>,
        );
        let rows: Vec<Row> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let mapped = stmt.query_map(params![paper_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut transitions = Vec::with_capacity(rows.len());
        for (seq, pid, from, to, actor, screening, extraction, payload, at) in rows {
            transitions.push(StateTransition {
                seq,
                paper_id: parse_uuid(&pid)?,
                from_state: from.as_deref().map(decode_state).transpose()?,
                to_state: decode_state(&to)?,
                actor,
                observed_hash: ProtocolHash {
                    screening,
                    extraction,
                },
                payload: serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Corrupted(format!("payload decode: {e}")))?,
                at,
            });
        }
        Ok(transitions)
    }

    /// Papers whose most recent transition was stamped under a protocol
    /// hash that differs from the live one, with the staleness scope.
    pub fn stale_papers(
        &self,
        live: &ProtocolHash,
    ) -> Result<Vec<(Uuid, StaleScope)>, StoreError> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT t.paper_id, t.screening_hash, t.extraction_hash
                 FROM transitions t
                 WHERE t.seq = (SELECT MAX(t2.seq) FROM transitions t2
                                WHERE t2.paper_id = t.paper_id)
                 ORDER BY t.seq",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut stale = Vec::new();
        for (pid, screening, extraction) in rows {
            let recorded = ProtocolHash {
                screening,
                extraction,
            };
            if let Some(scope) = live.staleness(&recorded) {
                stale.push((parse_uuid(&pid)?, scope));
            }
        }
        Ok(stale)
    }

    // ── Documents ────────────────────────────────────────────

    pub fn put_pdf(&self, paper_id: Uuid, bytes: &[u8]) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO documents (paper_id, pdf) VALUES (?1, ?2)
             ON CONFLICT(paper_id) DO UPDATE SET pdf = excluded.pdf",
            params![paper_id.to_string(), bytes],
        )?;
        Ok(())
    }

    pub fn pdf(&self, paper_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let bytes: Option<Option<Vec<u8>>> = self
            .conn()
            .query_row(
                "SELECT pdf FROM documents WHERE paper_id = ?1",
                params![paper_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.flatten())
    }

    pub fn put_parsed_text(
        &self,
        paper_id: Uuid,
        text: &str,
        quality: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO documents (paper_id, parsed_text, parse_quality) VALUES (?1, ?2, ?3)
             ON CONFLICT(paper_id) DO UPDATE SET
                 parsed_text = excluded.parsed_text,
                 parse_quality = excluded.parse_quality",
            params![paper_id.to_string(), text, quality],
        )?;
        Ok(())
    }

    pub fn parsed_text(&self, paper_id: Uuid) -> Result<Option<(String, String)>, StoreError> {
        let row: Option<(Option<String>, Option<String>)> = self
            .conn()
            .query_row(
                "SELECT parsed_text, parse_quality FROM documents WHERE paper_id = ?1",
                params![paper_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((Some(text), quality)) => Some((text, quality.unwrap_or_default())),
            _ => None,
        })
    }

    // ── Evidence & audits ────────────────────────────────────

    /// Replace the paper's evidence spans (re-extraction overwrites; the
    /// superseded extraction remains visible in the transition payloads).
    pub fn record_evidence(
        &self,
        paper_id: Uuid,
        spans: &[EvidenceSpan],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM evidence_spans WHERE paper_id = ?1",
            params![paper_id.to_string()],
        )?;
        for span in spans {
            tx.execute(
                "INSERT INTO evidence_spans (paper_id, field_name, value, source_snippet, location)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    paper_id.to_string(),
                    span.field_name,
                    span.value,
                    span.source_snippet,
                    span.location,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn evidence(&self, paper_id: Uuid) -> Result<Vec<EvidenceSpan>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT field_name, value, source_snippet, location
             FROM evidence_spans WHERE paper_id = ?1 ORDER BY id",
        )?;
        let mapped = stmt.query_map(params![paper_id.to_string()], |row| {
            Ok(EvidenceSpan {
                field_name: row.get(0)?,
                value: row.get(1)?,
                source_snippet: row.get(2)?,
                location: row.get(3)?,
            })
        })?;
        Ok(mapped.collect::<Result<_, _>>()?)
    }

    pub fn record_audits(
        &self,
        paper_id: Uuid,
        verdicts: &[AuditVerdict],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM audit_verdicts WHERE paper_id = ?1",
            params![paper_id.to_string()],
        )?;
        for v in verdicts {
            tx.execute(
                "INSERT INTO audit_verdicts (paper_id, field_name, verified, method, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    paper_id.to_string(),
                    v.field_name,
                    v.verified,
                    v.method.map(|m| m.as_str()),
                    v.detail,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn audits(&self, paper_id: Uuid) -> Result<Vec<AuditVerdict>, StoreError> {
        let rows: Vec<(String, bool, Option<String>, Option<String>)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT field_name, verified, method, detail
                 FROM audit_verdicts WHERE paper_id = ?1 ORDER BY id",
            )?;
            let mapped = stmt.query_map(params![paper_id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut verdicts = Vec::with_capacity(rows.len());
        for (field_name, verified, method, detail) in rows {
            let method = method
                .as_deref()
                .map(|m| {
                    m.parse::<VerifyMethod>()
                        .map_err(StoreError::Corrupted)
                })
                .transpose()?;
            verdicts.push(AuditVerdict {
                field_name,
                verified,
                method,
                detail,
            });
        }
        Ok(verdicts)
    }

    // ── Dedup stats ──────────────────────────────────────────

    /// Dedup runs once per review; recording twice replaces the single row.
    pub fn record_dedup_stats(&self, stats: &DedupStats) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO dedup_stats (id, input, rejected, exact_merged, fuzzy_merged, unique_count, recorded_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 input = excluded.input,
                 rejected = excluded.rejected,
                 exact_merged = excluded.exact_merged,
                 fuzzy_merged = excluded.fuzzy_merged,
                 unique_count = excluded.unique_count,
                 recorded_at = excluded.recorded_at",
            params![
                stats.input as i64,
                stats.rejected as i64,
                stats.exact_merged as i64,
                stats.fuzzy_merged as i64,
                stats.unique as i64,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn dedup_stats(&self) -> Result<Option<DedupStats>, StoreError> {
        let row: Option<(i64, i64, i64, i64, i64)> = self
            .conn()
            .query_row(
                "SELECT input, rejected, exact_merged, fuzzy_merged, unique_count
                 FROM dedup_stats WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(input, rejected, exact, fuzzy, unique)| DedupStats {
            input: input as usize,
            rejected: rejected as usize,
            exact_merged: exact as usize,
            fuzzy_merged: fuzzy as usize,
            unique: unique as usize,
        }))
    }

    // ── Review runs ──────────────────────────────────────────

    pub fn start_run(&self, hash: &ProtocolHash) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO review_runs (screening_hash, extraction_hash, started_at, status)
             VALUES (?1, ?2, ?3, 'running')",
            params![hash.screening, hash.extraction, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, status: RunStatus) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE review_runs SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now(), run_id],
        )?;
        Ok(())
    }

    // ── Pipeline stats ───────────────────────────────────────

    pub fn pipeline_stats(&self) -> Result<PipelineStats, StoreError> {
        let conn = self.conn();
        let mut stats = PipelineStats::default();

        stats.total_papers =
            conn.query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;

        {
            let mut stmt = conn.prepare(
                "SELECT t.to_state, COUNT(*)
                 FROM transitions t
                 WHERE t.seq = (SELECT MAX(t2.seq) FROM transitions t2
                                WHERE t2.paper_id = t.paper_id)
                 GROUP BY t.to_state",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in mapped {
                let (state, count) = row?;
                stats.by_state.insert(state, count);
            }
        }

        stats.spans_total =
            conn.query_row("SELECT COUNT(*) FROM evidence_spans", [], |row| row.get(0))?;
        stats.spans_verified = conn.query_row(
            "SELECT COUNT(*) FROM audit_verdicts WHERE verified = 1",
            [],
            |row| row.get(0),
        )?;
        stats.spans_flagged = conn.query_row(
            "SELECT COUNT(*) FROM audit_verdicts WHERE verified = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(stats)
    }
}

fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current = current_version(conn);
    let migrations: Vec<(i64, &str)> = vec![(1, SCHEMA_V1)];
    for (version, sql) in migrations {
        if version > current {
            tracing::info!(version, "Running store migration");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    reason: e.to_string(),
                })?;
        }
    }
    Ok(())
}

fn current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupted(format!("bad uuid '{raw}': {e}")))
}

fn decode_state(raw: &str) -> Result<PaperState, StoreError> {
    PaperState::decode(raw).map_err(StoreError::Corrupted)
}
