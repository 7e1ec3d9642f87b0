//! Facts-pass progress ledger.
//!
//! Listen events have no natural key, so a re-run of the facts pass would
//! append them again. The ledger records how far a facts pass got for a given
//! source fingerprint; the sink advances it inside the same transaction as
//! each listen batch.

use crate::error::{EtlError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactsCheckpoint {
    pub source_fingerprint: String,
    /// Source row offset covered by the committed listen batches.
    pub rows_committed: u64,
    pub batches_committed: u64,
    pub completed: bool,
}

impl FactsCheckpoint {
    pub fn new(source_fingerprint: impl Into<String>) -> Self {
        Self {
            source_fingerprint: source_fingerprint.into(),
            rows_committed: 0,
            batches_committed: 0,
            completed: false,
        }
    }
}

/// How a facts pass treats an existing checkpoint for its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Refuse to start if any checkpoint exists.
    #[default]
    Fresh,
    /// Continue after the committed rows of an incomplete checkpoint.
    Resume,
    /// Discard the checkpoint and append from row zero.
    ForceRestart,
}

/// What the facts pass should do given the stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    StartAt(FactsCheckpoint),
    Restart,
}

pub fn plan_resume(existing: Option<FactsCheckpoint>, mode: ResumeMode) -> Result<ResumePlan> {
    match (existing, mode) {
        (None, _) => Ok(ResumePlan::Restart),
        (Some(_), ResumeMode::ForceRestart) => Ok(ResumePlan::Restart),
        (Some(cp), ResumeMode::Resume) if !cp.completed => Ok(ResumePlan::StartAt(cp)),
        (Some(cp), _) => Err(EtlError::CheckpointConflict {
            rows_committed: cp.rows_committed,
            batches_committed: cp.batches_committed,
            completed: cp.completed,
        }),
    }
}

pub(crate) fn ensure_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS etl_checkpoints (
            source_fingerprint  TEXT PRIMARY KEY,
            rows_committed      INTEGER NOT NULL,
            batches_committed   INTEGER NOT NULL,
            completed           INTEGER NOT NULL DEFAULT 0,
            updated_at          TEXT NOT NULL
        );
        "#,
    )
}

pub(crate) fn load(conn: &Connection, fingerprint: &str) -> rusqlite::Result<Option<FactsCheckpoint>> {
    conn.query_row(
        "SELECT rows_committed, batches_committed, completed
         FROM etl_checkpoints WHERE source_fingerprint = ?1",
        params![fingerprint],
        |row| {
            Ok(FactsCheckpoint {
                source_fingerprint: fingerprint.to_string(),
                rows_committed: row.get::<_, i64>(0)? as u64,
                batches_committed: row.get::<_, i64>(1)? as u64,
                completed: row.get::<_, i64>(2)? != 0,
            })
        },
    )
    .optional()
}

pub(crate) fn store(conn: &Connection, checkpoint: &FactsCheckpoint) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO etl_checkpoints
             (source_fingerprint, rows_committed, batches_committed, completed, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(source_fingerprint) DO UPDATE SET
             rows_committed = excluded.rows_committed,
             batches_committed = excluded.batches_committed,
             completed = excluded.completed,
             updated_at = excluded.updated_at",
        params![
            checkpoint.source_fingerprint,
            checkpoint.rows_committed as i64,
            checkpoint.batches_committed as i64,
            checkpoint.completed as i64,
        ],
    )?;
    Ok(())
}

pub(crate) fn clear(conn: &Connection, fingerprint: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM etl_checkpoints WHERE source_fingerprint = ?1",
        params![fingerprint],
    )?;
    Ok(())
}
