use super::{BatchSink, WriteReport, LISTENS_TABLE, SONGS_TABLE, USERS_TABLE};
use crate::domain::{ListenEvent, Song, User};
use crate::error::{EtlError, Result};
use crate::pipeline::ingestion::checkpoint::FactsCheckpoint;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// In-memory sink for development and testing.
///
/// Mirrors the SQLite sink's semantics: keyed upserts ignore existing keys,
/// listens referencing unknown users or songs fail the whole batch, and the
/// checkpoint moves only when a listen batch lands.
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    songs: BTreeMap<String, Song>,
    users: BTreeSet<String>,
    listens: Vec<ListenEvent>,
    checkpoints: HashMap<String, FactsCheckpoint>,
    fail_on: Option<(&'static str, u64)>,
    batches: Vec<(&'static str, u64, usize)>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes batch `batch` of `table` fail with a persistence error.
    pub fn fail_on_batch(&self, table: &'static str, batch: u64) {
        self.lock().fail_on = Some((table, batch));
    }

    pub fn clear_failure(&self) {
        self.lock().fail_on = None;
    }

    pub fn songs(&self) -> Vec<Song> {
        self.lock().songs.values().cloned().collect()
    }

    pub fn users(&self) -> Vec<String> {
        self.lock().users.iter().cloned().collect()
    }

    pub fn listens(&self) -> Vec<ListenEvent> {
        self.lock().listens.clone()
    }

    /// `(table, batch index, rows)` for every committed batch, in commit order.
    pub fn batch_log(&self) -> Vec<(&'static str, u64, usize)> {
        self.lock().batches.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn check_failure(&self, table: &'static str, batch: u64) -> Result<()> {
        match self.fail_on {
            Some((t, b)) if t == table && b == batch => Err(EtlError::persistence(
                table,
                batch,
                "injected failure",
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BatchSink for InMemorySink {
    async fn upsert_songs(&self, batch: u64, songs: Vec<Song>) -> Result<WriteReport> {
        let mut state = self.lock();
        state.check_failure(SONGS_TABLE, batch)?;
        let attempted = songs.len() as u64;
        let mut inserted = 0;
        for song in songs {
            if !state.songs.contains_key(&song.song_id) {
                state.songs.insert(song.song_id.clone(), song);
                inserted += 1;
            }
        }
        state.batches.push((SONGS_TABLE, batch, attempted as usize));
        debug!("songs batch {}: {} inserted", batch, inserted);
        Ok(WriteReport { attempted, inserted })
    }

    async fn upsert_users(&self, batch: u64, users: Vec<User>) -> Result<WriteReport> {
        let mut state = self.lock();
        state.check_failure(USERS_TABLE, batch)?;
        let attempted = users.len() as u64;
        let mut inserted = 0;
        for user in users {
            if state.users.insert(user.user_id) {
                inserted += 1;
            }
        }
        state.batches.push((USERS_TABLE, batch, attempted as usize));
        debug!("users batch {}: {} inserted", batch, inserted);
        Ok(WriteReport { attempted, inserted })
    }

    async fn append_listens(
        &self,
        batch: u64,
        listens: Vec<ListenEvent>,
        progress: FactsCheckpoint,
    ) -> Result<WriteReport> {
        let mut state = self.lock();
        state.check_failure(LISTENS_TABLE, batch)?;
        if let Some(orphan) = listens
            .iter()
            .find(|l| !state.users.contains(&l.user_id) || !state.songs.contains_key(&l.song_id))
        {
            return Err(EtlError::persistence(
                LISTENS_TABLE,
                batch,
                format!(
                    "FOREIGN KEY constraint failed (user {}, song {})",
                    orphan.user_id, orphan.song_id
                ),
            ));
        }
        let attempted = listens.len() as u64;
        state.listens.extend(listens);
        state
            .checkpoints
            .insert(progress.source_fingerprint.clone(), progress);
        state.batches.push((LISTENS_TABLE, batch, attempted as usize));
        Ok(WriteReport {
            attempted,
            inserted: attempted,
        })
    }

    async fn load_checkpoint(&self, source_fingerprint: &str) -> Result<Option<FactsCheckpoint>> {
        Ok(self.lock().checkpoints.get(source_fingerprint).cloned())
    }

    async fn save_checkpoint(&self, progress: FactsCheckpoint) -> Result<()> {
        self.lock()
            .checkpoints
            .insert(progress.source_fingerprint.clone(), progress);
        Ok(())
    }

    async fn clear_checkpoint(&self, source_fingerprint: &str) -> Result<()> {
        self.lock().checkpoints.remove(source_fingerprint);
        Ok(())
    }
}
