//! Pass sequencing for a load.
//!
//! A run moves `Idle → SongsPass → FactsPass → Done`; any fatal error moves it
//! to `Failed` and halts. Each pass streams the whole source through the
//! reader and normalizer stages and a single writer that deduplicates entity
//! keys and flushes bounded batches to the sink in source order.

mod stages;
mod summary;

pub use summary::{PassSummary, RunSummary, TableSummary};

use crate::config::EtlConfig;
use crate::domain::{ListenEvent, Song, User};
use crate::error::{EtlError, PassName, PipelineFailure, Result};
use crate::observability::metrics;
use crate::pipeline::ingestion::checkpoint::{plan_resume, FactsCheckpoint, ResumeMode, ResumePlan};
use crate::pipeline::ingestion::chunk_reader::{ChunkReader, SourceSchema};
use crate::pipeline::ingestion::fingerprint::source_fingerprint;
use crate::pipeline::processing::dedup::{Admission, EntityDeduplicator, EntityKind};
use crate::pipeline::processing::normalize::FieldNormalizer;
use crate::pipeline::storage::{BatchSink, WriteReport, LISTENS_TABLE, SONGS_TABLE, USERS_TABLE};
use serde::Serialize;
use stages::StageSettings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    SongsPass,
    FactsPass,
    Done,
    Failed(PassName),
}

/// Which passes a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassSelection {
    #[default]
    Both,
    SongsOnly,
    /// Assumes songs are already loaded.
    FactsOnly,
}

impl PassSelection {
    fn songs(&self) -> bool {
        matches!(self, PassSelection::Both | PassSelection::SongsOnly)
    }

    fn facts(&self) -> bool {
        matches!(self, PassSelection::Both | PassSelection::FactsOnly)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub passes: PassSelection,
    pub resume: ResumeMode,
    /// Operator abort; checked at chunk boundaries.
    pub cancel: CancellationToken,
}

/// Result of validating a source without writing anything.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCheck {
    pub source: PathBuf,
    pub columns: Vec<String>,
    pub skip_rule: &'static str,
    pub fingerprint: String,
}

/// Opens the source, validates its header and resolves the skip rule.
pub fn check_source(config: &EtlConfig) -> Result<SourceCheck> {
    config.validate()?;
    let reader = open_source(config)?;
    let normalizer = normalizer_for(config, &reader);
    Ok(SourceCheck {
        source: reader.path().to_path_buf(),
        columns: reader.header().columns().to_vec(),
        skip_rule: normalizer.skip_rule().name(),
        fingerprint: source_fingerprint(reader.path())?,
    })
}

fn open_source(config: &EtlConfig) -> Result<ChunkReader> {
    let schema = SourceSchema::for_columns(&config.columns);
    ChunkReader::open(&config.source, config.chunk_size, &schema)
}

fn normalizer_for(config: &EtlConfig, reader: &ChunkReader) -> FieldNormalizer {
    FieldNormalizer::for_header(
        reader.header(),
        &config.columns,
        config.skip_policy,
        config.event_type.clone(),
    )
}

pub struct Orchestrator {
    config: EtlConfig,
    sink: Arc<dyn BatchSink>,
    state: PipelineState,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(config: EtlConfig, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            config,
            sink,
            state: PipelineState::Idle,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    fn transition(&mut self, next: PipelineState) {
        info!("Pipeline state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, pass: PassName, error: EtlError) -> PipelineFailure {
        metrics::pass::failed(pass.as_str());
        if matches!(error, EtlError::Cancelled { .. }) {
            warn!("{} pass cancelled", pass);
        } else {
            error!("{} pass failed: {}", pass, error);
        }
        self.transition(PipelineState::Failed(pass));
        PipelineFailure::new(pass, error)
    }

    /// Runs the selected passes in order and stops at the first failure.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run(&mut self, options: RunOptions) -> std::result::Result<RunSummary, PipelineFailure> {
        let started = Instant::now();
        let first = if options.passes.songs() {
            PassName::Songs
        } else {
            PassName::Facts
        };
        if let Err(e) = self.config.validate() {
            return Err(self.fail(first, e));
        }

        println!("🚀 Starting load {} from {}", self.run_id, self.config.source.display());
        info!("Starting load from {}", self.config.source.display());
        let mut summary = RunSummary::new(self.run_id, self.config.source.clone());

        if options.passes.songs() {
            self.transition(PipelineState::SongsPass);
            match self.songs_pass(&options.cancel).await {
                Ok(pass) => summary.songs = Some(pass),
                Err(e) => return Err(self.fail(PassName::Songs, e)),
            }
        }

        if options.passes.facts() {
            self.transition(PipelineState::FactsPass);
            match self.facts_pass(options.resume, &options.cancel).await {
                Ok(pass) => summary.facts = Some(pass),
                Err(e) => return Err(self.fail(PassName::Facts, e)),
            }
        }

        self.transition(PipelineState::Done);
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        println!("🎉 Load {} finished in {:.1}s", self.run_id, summary.elapsed_secs);
        Ok(summary)
    }

    fn stage_settings(&self, pass: PassName) -> StageSettings {
        StageSettings {
            pass,
            workers: self.config.workers,
            queue_depth: self.config.queue_depth,
            read_timeout: self.config.read_timeout(),
        }
    }

    fn report_batch(
        &self,
        summary: &mut PassSummary,
        table: &'static str,
        batch: u64,
        report: &WriteReport,
    ) {
        summary.table(table).record(report);
        println!(
            "   💾 [{}] {} batch {}: {} discovered, {} inserted",
            summary.pass, table, batch, report.attempted, report.inserted
        );
        info!(
            pass = %summary.pass,
            table,
            batch,
            discovered = report.attempted,
            inserted = report.inserted,
            "Batch committed"
        );
    }

    /// Streams the source once and persists every distinct song.
    #[instrument(skip_all, fields(pass = "songs"))]
    pub async fn songs_pass(&self, cancel: &CancellationToken) -> Result<PassSummary> {
        let pass = PassName::Songs;
        let started = Instant::now();
        let reader = open_source(&self.config)?;
        let normalizer = normalizer_for(&self.config, &reader);
        let mut summary = PassSummary::new(pass, normalizer.skip_rule().name());

        println!("🎵 Songs pass: streaming {}", reader.path().display());
        info!("Songs pass started (chunk {}, batch {})", reader.window(), self.config.batch_size);

        let stop = cancel.child_token();
        let _stop_guard = stop.clone().drop_guard();
        let mut chunks = stages::spawn(
            reader.chunks()?,
            move |record| normalizer.normalize_song(record),
            self.stage_settings(pass),
            stop,
        );

        let batch_size = self.config.batch_size;
        let dedup = EntityDeduplicator::new(EntityKind::Song);
        let mut pending: Vec<Song> = Vec::with_capacity(batch_size);
        let mut next_batch = 0u64;

        while let Some(chunk) = chunks.next(cancel).await? {
            summary.absorb(&chunk);
            for song in chunk.accepted {
                if dedup.admit(&song.song_id) == Admission::Suppress {
                    continue;
                }
                pending.push(song);
                if pending.len() >= batch_size {
                    self.flush_songs(&mut summary, &mut next_batch, &mut pending).await?;
                }
            }
        }
        self.flush_songs(&mut summary, &mut next_batch, &mut pending).await?;

        summary.entities_admitted = dedup.admitted();
        summary.entities_suppressed = dedup.suppressed();
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        metrics::pass::completed(pass.as_str());

        let songs = summary.table_totals(SONGS_TABLE);
        println!(
            "✅ Songs pass complete: {} rows, {} distinct songs, {} inserted, {} dropped",
            summary.rows_read,
            summary.entities_admitted,
            songs.inserted,
            summary.rows_dropped_total()
        );
        info!(
            rows = summary.rows_read,
            admitted = summary.entities_admitted,
            suppressed = summary.entities_suppressed,
            inserted = songs.inserted,
            "Songs pass complete"
        );
        Ok(summary)
    }

    async fn flush_songs(
        &self,
        summary: &mut PassSummary,
        next_batch: &mut u64,
        pending: &mut Vec<Song>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(pending, Vec::with_capacity(self.config.batch_size));
        let report = self.sink.upsert_songs(*next_batch, rows).await?;
        self.report_batch(summary, SONGS_TABLE, *next_batch, &report);
        *next_batch += 1;
        Ok(())
    }

    async fn flush_users(
        &self,
        summary: &mut PassSummary,
        next_batch: &mut u64,
        pending: &mut Vec<User>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(pending, Vec::with_capacity(self.config.batch_size));
        let report = self.sink.upsert_users(*next_batch, rows).await?;
        self.report_batch(summary, USERS_TABLE, *next_batch, &report);
        *next_batch += 1;
        Ok(())
    }

    /// Appends pending listens and advances `progress` to `rows_covered`.
    /// Progress only moves once the batch has committed.
    async fn flush_listens(
        &self,
        summary: &mut PassSummary,
        progress: &mut FactsCheckpoint,
        rows_covered: u64,
        pending: &mut Vec<ListenEvent>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = progress.batches_committed;
        let next = FactsCheckpoint {
            rows_committed: rows_covered,
            batches_committed: batch + 1,
            ..progress.clone()
        };
        let rows = std::mem::replace(pending, Vec::with_capacity(self.config.batch_size));
        let report = self.sink.append_listens(batch, rows, next.clone()).await?;
        self.report_batch(summary, LISTENS_TABLE, batch, &report);
        *progress = next;
        Ok(())
    }

    async fn start_checkpoint(&self, fingerprint: String, resume: ResumeMode) -> Result<FactsCheckpoint> {
        let existing = self.sink.load_checkpoint(&fingerprint).await?;
        let had_checkpoint = existing.is_some();
        match plan_resume(existing, resume)? {
            ResumePlan::StartAt(checkpoint) => {
                println!(
                    "⏩ Resuming facts pass after row {} ({} batches already committed)",
                    checkpoint.rows_committed, checkpoint.batches_committed
                );
                info!(
                    rows_committed = checkpoint.rows_committed,
                    batches_committed = checkpoint.batches_committed,
                    "Resuming facts pass from checkpoint"
                );
                Ok(checkpoint)
            }
            ResumePlan::Restart => {
                if had_checkpoint {
                    warn!("Discarding facts checkpoint; listens already committed will be appended again");
                    println!("⚠️  Force restart: previously committed listens will be duplicated");
                    self.sink.clear_checkpoint(&fingerprint).await?;
                }
                let checkpoint = FactsCheckpoint::new(fingerprint);
                self.sink.save_checkpoint(checkpoint.clone()).await?;
                Ok(checkpoint)
            }
        }
    }

    /// Streams the source again and persists users and listen events.
    ///
    /// Pending users are always flushed before a listen batch, so every
    /// committed listen references a committed user. Songs must already be
    /// loaded.
    #[instrument(skip_all, fields(pass = "facts"))]
    pub async fn facts_pass(&self, resume: ResumeMode, cancel: &CancellationToken) -> Result<PassSummary> {
        let pass = PassName::Facts;
        let started = Instant::now();
        let reader = open_source(&self.config)?;
        let normalizer = normalizer_for(&self.config, &reader);
        let mut summary = PassSummary::new(pass, normalizer.skip_rule().name());
        info!("Facts pass skip rule: {}", normalizer.skip_rule().name());

        let fingerprint = source_fingerprint(reader.path())?;
        let mut progress = self.start_checkpoint(fingerprint, resume).await?;
        let start_row = progress.rows_committed;
        if start_row > 0 {
            summary.resumed_from_row = Some(start_row);
        }

        println!("🎧 Facts pass: streaming {}", reader.path().display());
        info!("Facts pass started at row {}", start_row);

        let stop = cancel.child_token();
        let _stop_guard = stop.clone().drop_guard();
        let mut chunks = stages::spawn(
            reader.chunks_from(start_row)?,
            move |record| normalizer.normalize_listen(record),
            self.stage_settings(pass),
            stop,
        );

        let batch_size = self.config.batch_size;
        let dedup = EntityDeduplicator::new(EntityKind::User);
        let mut users: Vec<User> = Vec::with_capacity(batch_size);
        let mut listens: Vec<ListenEvent> = Vec::with_capacity(batch_size);
        let mut next_user_batch = 0u64;
        let mut source_end = start_row;

        while let Some(chunk) = chunks.next(cancel).await? {
            summary.absorb(&chunk);
            source_end = chunk.end_row;
            for candidate in chunk.accepted {
                if dedup.admit(&candidate.user.user_id) == Admission::Admit {
                    users.push(candidate.user);
                    if users.len() >= batch_size {
                        self.flush_users(&mut summary, &mut next_user_batch, &mut users).await?;
                    }
                }
                listens.push(candidate.listen);
                if listens.len() >= batch_size {
                    self.flush_users(&mut summary, &mut next_user_batch, &mut users).await?;
                    self.flush_listens(&mut summary, &mut progress, candidate.row + 1, &mut listens)
                        .await?;
                }
            }
        }
        self.flush_users(&mut summary, &mut next_user_batch, &mut users).await?;
        self.flush_listens(&mut summary, &mut progress, source_end, &mut listens)
            .await?;

        progress.rows_committed = source_end;
        progress.completed = true;
        self.sink.save_checkpoint(progress).await?;

        summary.entities_admitted = dedup.admitted();
        summary.entities_suppressed = dedup.suppressed();
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        metrics::pass::completed(pass.as_str());

        let users_total = summary.table_totals(USERS_TABLE);
        let listens_total = summary.table_totals(LISTENS_TABLE);
        println!(
            "✅ Facts pass complete: {} rows, {} listens, {} new users, {} dropped",
            summary.rows_read,
            listens_total.inserted,
            users_total.inserted,
            summary.rows_dropped_total()
        );
        info!(
            rows = summary.rows_read,
            listens = listens_total.inserted,
            users = users_total.inserted,
            "Facts pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::storage::InMemorySink;
    use std::io::Write;

    const HEADER: &str = "session_id,track_id,date,hour_of_day,duration,not_skipped,\
tempo,valence,energy,danceability,acousticness,instrumentalness,liveness,loudness";

    fn source(rows: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn config(path: &std::path::Path, batch_size: usize) -> EtlConfig {
        EtlConfig {
            source: path.to_path_buf(),
            chunk_size: 2,
            batch_size,
            ..EtlConfig::default()
        }
    }

    const ROWS: &[&str] = &[
        "u1,t1,2018-07-15,14,185,1,120,0.5,0.6,0.7,0.1,0.0,0.2,-5",
        "u1,t2,2018-07-15,15,185000,0,98,0.4,0.5,0.6,0.2,0.0,0.1,-6",
        "u2,t1,2018-07-16,9,200,1,120,0.5,0.6,0.7,0.1,0.0,0.2,-5",
        "u3,t3,not-a-date,,200,1,110,0.5,0.6,0.7,0.1,0.0,0.2,-5",
        "u2,t3,2018-07-16,10,,1,110,0.5,0.6,0.7,0.1,0.0,0.2,-5",
    ];

    #[tokio::test]
    async fn test_run_reaches_done_and_preserves_foreign_keys() {
        let file = source(ROWS);
        let sink = InMemorySink::new();
        let mut orchestrator = Orchestrator::new(config(file.path(), 2), Arc::new(sink.clone()));
        assert_eq!(orchestrator.state(), PipelineState::Idle);

        let summary = orchestrator.run(RunOptions::default()).await.unwrap();
        assert_eq!(orchestrator.state(), PipelineState::Done);

        assert_eq!(sink.songs().len(), 3);
        assert_eq!(sink.users(), vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(sink.listens().len(), 4);

        let facts = summary.facts.unwrap();
        assert_eq!(facts.rows_read, 5);
        assert_eq!(facts.rows_dropped.get("missing_timestamp"), Some(&1));
        assert_eq!(summary.songs.unwrap().entities_suppressed, 2);

        // Users always land before the listen batch that needs them.
        let log = sink.batch_log();
        let first_listen = log.iter().position(|(t, _, _)| *t == LISTENS_TABLE).unwrap();
        assert!(log[..first_listen].iter().any(|(t, _, _)| *t == USERS_TABLE));
    }

    #[tokio::test]
    async fn test_failed_batch_moves_to_failed_with_pass_name() {
        let file = source(ROWS);
        let sink = InMemorySink::new();
        sink.fail_on_batch(SONGS_TABLE, 1);
        let mut orchestrator = Orchestrator::new(config(file.path(), 2), Arc::new(sink.clone()));

        let failure = orchestrator.run(RunOptions::default()).await.unwrap_err();
        assert_eq!(failure.pass, PassName::Songs);
        assert!(matches!(
            failure.error,
            EtlError::PersistenceFailure { batch: 1, .. }
        ));
        assert_eq!(orchestrator.state(), PipelineState::Failed(PassName::Songs));
        assert!(sink.listens().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_without_writes() {
        let file = source(ROWS);
        let sink = InMemorySink::new();
        let mut orchestrator = Orchestrator::new(config(file.path(), 2), Arc::new(sink.clone()));
        let options = RunOptions::default();
        options.cancel.cancel();

        let failure = orchestrator.run(options).await.unwrap_err();
        assert!(failure.is_cancelled());
        assert!(sink.songs().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_reading() {
        let sink = InMemorySink::new();
        let mut cfg = config(std::path::Path::new("/nonexistent.csv"), 2);
        cfg.batch_size = 0;
        let mut orchestrator = Orchestrator::new(cfg, Arc::new(sink));
        let failure = orchestrator.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(failure.error, EtlError::Config(_)));
    }

    #[test]
    fn test_check_source_reports_resolved_rule() {
        let file = source(ROWS);
        let check = check_source(&config(file.path(), 2)).unwrap();
        assert_eq!(check.skip_rule, "not_skipped_flag");
        assert_eq!(check.columns.len(), 14);
        assert_eq!(check.fingerprint.len(), 64);
    }
}
