use super::pool::{ConnectionPool, PoolError};
use super::{BatchSink, WriteReport, LISTENS_TABLE, SONGS_TABLE, USERS_TABLE};
use crate::domain::{ListenEvent, Song, User};
use crate::error::{EtlError, Result};
use crate::observability::metrics;
use crate::pipeline::ingestion::checkpoint::{self, FactsCheckpoint};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const CHECKPOINT_TABLE: &str = "etl_checkpoints";

/// Timestamp layout used for the `listens.ts` column.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const INSERT_SONG: &str = "INSERT INTO songs
    (song_id, release_year, duration_ms, tempo, valence, energy, danceability,
     acousticness, instrumentalness, liveness, loudness)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT(song_id) DO NOTHING";

const INSERT_USER: &str = "INSERT INTO users (user_id) VALUES (?1)
    ON CONFLICT(user_id) DO NOTHING";

const INSERT_LISTEN: &str = "INSERT INTO listens
    (user_id, song_id, ts, played_ms, event_type, skipped, session_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Batch sink backed by a SQLite database provisioned elsewhere.
///
/// The `users`, `songs` and `listens` tables must already exist. The only table
/// this sink creates is the checkpoint ledger.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    path: PathBuf,
    pool: ConnectionPool,
    write_timeout: Duration,
}

impl SqliteSink {
    pub async fn open<P: AsRef<Path>>(
        path: P,
        max_connections: usize,
        write_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(EtlError::Config(format!(
                "target database {} does not exist; provision the schema first",
                path.display()
            )));
        }
        let pool = ConnectionPool::new(&path, max_connections, write_timeout)
            .map_err(|e| EtlError::persistence(CHECKPOINT_TABLE, 0, e))?;
        let sink = Self {
            path,
            pool,
            write_timeout,
        };

        let missing = sink
            .pool
            .with_connection(sink.write_timeout, |conn| {
                checkpoint::ensure_table(conn)?;
                missing_tables(conn, &[USERS_TABLE, SONGS_TABLE, LISTENS_TABLE])
            })
            .await
            .map_err(|e| EtlError::persistence(CHECKPOINT_TABLE, 0, e))?;
        if !missing.is_empty() {
            return Err(EtlError::Config(format!(
                "target database {} is missing table(s) {:?}",
                sink.path.display(),
                missing
            )));
        }

        info!(
            "Opened SQLite sink at {} (max {} connections)",
            sink.path.display(),
            sink.pool.max_connections()
        );
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_batch<F>(&self, table: &'static str, batch: u64, attempted: u64, f: F) -> Result<WriteReport>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<u64> + Send + 'static,
    {
        let started = Instant::now();
        match self.pool.with_connection(self.write_timeout, f).await {
            Ok(inserted) => {
                let report = WriteReport { attempted, inserted };
                metrics::sink::batch_written(table, attempted, inserted, started.elapsed().as_secs_f64());
                debug!(
                    "{} batch {}: {} attempted, {} inserted in {:?}",
                    table,
                    batch,
                    attempted,
                    inserted,
                    started.elapsed()
                );
                Ok(report)
            }
            Err(e) => {
                metrics::sink::batch_failed(table);
                Err(persistence_error(table, batch, e))
            }
        }
    }
}

fn persistence_error(table: &'static str, batch: u64, err: PoolError) -> EtlError {
    match err {
        PoolError::Timeout(waited) => EtlError::persistence(
            table,
            batch,
            format!("write did not complete within {:?}", waited),
        ),
        other => EtlError::persistence(table, batch, other),
    }
}

fn missing_tables(conn: &Connection, tables: &[&str]) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    let mut missing = Vec::new();
    for table in tables {
        let count: i64 = stmt.query_row(params![table], |row| row.get(0))?;
        if count == 0 {
            missing.push(table.to_string());
        }
    }
    Ok(missing)
}

#[async_trait]
impl BatchSink for SqliteSink {
    async fn upsert_songs(&self, batch: u64, songs: Vec<Song>) -> Result<WriteReport> {
        let attempted = songs.len() as u64;
        self.write_batch(SONGS_TABLE, batch, attempted, move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0u64;
            {
                let mut stmt = tx.prepare_cached(INSERT_SONG)?;
                for song in &songs {
                    let d = &song.descriptors;
                    inserted += stmt.execute(params![
                        song.song_id,
                        song.release_year,
                        song.duration_ms,
                        d.tempo,
                        d.valence,
                        d.energy,
                        d.danceability,
                        d.acousticness,
                        d.instrumentalness,
                        d.liveness,
                        d.loudness,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn upsert_users(&self, batch: u64, users: Vec<User>) -> Result<WriteReport> {
        let attempted = users.len() as u64;
        self.write_batch(USERS_TABLE, batch, attempted, move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0u64;
            {
                let mut stmt = tx.prepare_cached(INSERT_USER)?;
                for user in &users {
                    inserted += stmt.execute(params![user.user_id])? as u64;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn append_listens(
        &self,
        batch: u64,
        listens: Vec<ListenEvent>,
        progress: FactsCheckpoint,
    ) -> Result<WriteReport> {
        let attempted = listens.len() as u64;
        self.write_batch(LISTENS_TABLE, batch, attempted, move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0u64;
            {
                let mut stmt = tx.prepare_cached(INSERT_LISTEN)?;
                for listen in &listens {
                    inserted += stmt.execute(params![
                        listen.user_id,
                        listen.song_id,
                        listen.ts.format(TS_FORMAT).to_string(),
                        listen.played_ms,
                        listen.event_type,
                        listen.skipped,
                        listen.session_id,
                    ])? as u64;
                }
            }
            checkpoint::store(&tx, &progress)?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn load_checkpoint(&self, source_fingerprint: &str) -> Result<Option<FactsCheckpoint>> {
        let fingerprint = source_fingerprint.to_string();
        self.pool
            .with_connection(self.write_timeout, move |conn| checkpoint::load(conn, &fingerprint))
            .await
            .map_err(|e| persistence_error(CHECKPOINT_TABLE, 0, e))
    }

    async fn save_checkpoint(&self, progress: FactsCheckpoint) -> Result<()> {
        let batch = progress.batches_committed;
        self.pool
            .with_connection(self.write_timeout, move |conn| checkpoint::store(conn, &progress))
            .await
            .map_err(|e| persistence_error(CHECKPOINT_TABLE, batch, e))
    }

    async fn clear_checkpoint(&self, source_fingerprint: &str) -> Result<()> {
        let fingerprint = source_fingerprint.to_string();
        self.pool
            .with_connection(self.write_timeout, move |conn| checkpoint::clear(conn, &fingerprint))
            .await
            .map_err(|e| persistence_error(CHECKPOINT_TABLE, 0, e))
    }
}
