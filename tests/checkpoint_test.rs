mod common;

use anyhow::Result;
use common::{row, Workspace, HEADER};
use music_etl::pipeline::ingestion::checkpoint::ResumeMode;
use music_etl::pipeline::storage::InMemorySink;
use music_etl::pipeline::{Orchestrator, PassSelection, PipelineState, RunOptions};
use music_etl::{EtlError, PassName};
use std::sync::Arc;

fn six_rows() -> Vec<String> {
    (0..6)
        .map(|i| {
            row(
                &format!("u{}", i % 3),
                &format!("t{}", i),
                "2018-07-15",
                &i.to_string(),
                "185",
                "1",
            )
        })
        .collect()
}

fn facts_only(resume: ResumeMode) -> RunOptions {
    RunOptions {
        passes: PassSelection::FactsOnly,
        resume,
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn test_interrupted_facts_pass_resumes_without_duplicates() -> Result<()> {
    let ws = Workspace::new(HEADER, &six_rows())?;
    let config = ws.config(2, 2);
    let sink = InMemorySink::new();
    sink.fail_on_batch("listens", 1);

    let mut first = Orchestrator::new(config.clone(), Arc::new(sink.clone()));
    let failure = first.run(RunOptions::default()).await.unwrap_err();
    assert_eq!(failure.pass, PassName::Facts);
    assert!(matches!(
        failure.error,
        EtlError::PersistenceFailure { batch: 1, .. }
    ));
    assert_eq!(first.state(), PipelineState::Failed(PassName::Facts));
    assert_eq!(sink.listens().len(), 2);

    sink.clear_failure();

    // Without an explicit decision the pass refuses to append again.
    let mut fresh = Orchestrator::new(config.clone(), Arc::new(sink.clone()));
    let conflict = fresh.run(facts_only(ResumeMode::Fresh)).await.unwrap_err();
    assert!(matches!(
        conflict.error,
        EtlError::CheckpointConflict {
            rows_committed: 2,
            batches_committed: 1,
            completed: false
        }
    ));

    let mut resumed = Orchestrator::new(config.clone(), Arc::new(sink.clone()));
    let summary = resumed.run(facts_only(ResumeMode::Resume)).await?;
    assert_eq!(resumed.state(), PipelineState::Done);

    let facts = summary.facts.expect("facts pass ran");
    assert_eq!(facts.resumed_from_row, Some(2));
    assert_eq!(facts.rows_read, 4);

    let listens = sink.listens();
    assert_eq!(listens.len(), 6);
    let mut songs: Vec<&str> = listens.iter().map(|l| l.song_id.as_str()).collect();
    songs.sort();
    assert_eq!(songs, vec!["t0", "t1", "t2", "t3", "t4", "t5"]);
    assert_eq!(sink.users().len(), 3);

    let listen_batches: Vec<u64> = sink
        .batch_log()
        .into_iter()
        .filter(|(table, _, _)| *table == "listens")
        .map(|(_, batch, _)| batch)
        .collect();
    assert_eq!(listen_batches, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_facts_pass_keeps_committed_batches() -> Result<()> {
    let ws = Workspace::new(HEADER, &six_rows())?;
    let config = ws.config(2, 2);
    let sink = InMemorySink::new();

    let mut songs = Orchestrator::new(config.clone(), Arc::new(sink.clone()));
    songs
        .run(RunOptions {
            passes: PassSelection::SongsOnly,
            ..RunOptions::default()
        })
        .await?;
    assert_eq!(sink.songs().len(), 6);

    let options = facts_only(ResumeMode::Fresh);
    options.cancel.cancel();
    let mut facts = Orchestrator::new(config.clone(), Arc::new(sink.clone()));
    let failure = facts.run(options).await.unwrap_err();

    assert!(failure.is_cancelled());
    assert_eq!(failure.pass, PassName::Facts);
    assert!(sink.listens().is_empty());

    // The checkpoint was opened, so the next run must resume explicitly.
    let mut resumed = Orchestrator::new(config.clone(), Arc::new(sink.clone()));
    resumed.run(facts_only(ResumeMode::Resume)).await?;
    assert_eq!(sink.listens().len(), 6);
    Ok(())
}
