// Pipeline storage: the batch sink seam and its SQLite and in-memory implementations

pub mod in_memory;
pub mod pool;
pub mod sqlite;

use crate::domain::{ListenEvent, Song, User};
use crate::error::Result;
use crate::pipeline::ingestion::checkpoint::FactsCheckpoint;
use async_trait::async_trait;
use serde::Serialize;

pub use in_memory::InMemorySink;
pub use sqlite::SqliteSink;

pub const USERS_TABLE: &str = "users";
pub const SONGS_TABLE: &str = "songs";
pub const LISTENS_TABLE: &str = "listens";

/// Outcome of one batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Rows handed to the store.
    pub attempted: u64,
    /// Rows that actually landed.
    pub inserted: u64,
}

impl WriteReport {
    /// Rows the store skipped on a key conflict.
    pub fn ignored(&self) -> u64 {
        self.attempted.saturating_sub(self.inserted)
    }
}

/// Bulk persistence of normalized records.
///
/// Every call is one atomic unit against the store: it either commits whole or
/// fails with `EtlError::PersistenceFailure` carrying the batch index.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Insert-on-conflict-do-nothing keyed by `song_id`.
    async fn upsert_songs(&self, batch: u64, songs: Vec<Song>) -> Result<WriteReport>;

    /// Insert-on-conflict-do-nothing keyed by `user_id`.
    async fn upsert_users(&self, batch: u64, users: Vec<User>) -> Result<WriteReport>;

    /// Plain append of listen events. `checkpoint` is stored in the same unit
    /// so progress and rows can never disagree.
    async fn append_listens(
        &self,
        batch: u64,
        listens: Vec<ListenEvent>,
        checkpoint: FactsCheckpoint,
    ) -> Result<WriteReport>;

    async fn load_checkpoint(&self, source_fingerprint: &str) -> Result<Option<FactsCheckpoint>>;

    async fn save_checkpoint(&self, checkpoint: FactsCheckpoint) -> Result<()>;

    async fn clear_checkpoint(&self, source_fingerprint: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_counts_conflicts() {
        let report = WriteReport {
            attempted: 10,
            inserted: 7,
        };
        assert_eq!(report.ignored(), 3);
        assert_eq!(WriteReport::default().ignored(), 0);
    }
}
