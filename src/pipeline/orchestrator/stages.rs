//! Reader and normalizer stages of a pass.
//!
//! One blocking reader feeds a bounded chunk queue; `workers` blocking
//! normalizers drain it in parallel. The writer consumes their output through
//! [`OrderedChunks`], which hands chunks back in source order.

use crate::error::{EtlError, PassName, Result};
use crate::observability::metrics;
use crate::pipeline::ingestion::chunk_reader::{Chunk, Chunks, RawRecord};
use crate::pipeline::processing::normalize::{DropReason, RecordOutcome};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A chunk after normalization.
#[derive(Debug)]
pub(crate) struct NormalizedChunk<T> {
    pub index: u64,
    /// Source row offset just past this chunk.
    pub end_row: u64,
    /// Source rows covered, decoded or not.
    pub rows: u64,
    pub accepted: Vec<T>,
    pub dropped: BTreeMap<&'static str, u64>,
}

pub(crate) struct StageSettings {
    pub pass: PassName,
    pub workers: usize,
    pub queue_depth: usize,
    pub read_timeout: Duration,
}

/// Starts the reader and normalizer stages for one pass.
///
/// `stop` halts the reader before its next chunk. Dropping the returned stream
/// also winds the stages down once their in-flight chunk is done.
pub(crate) fn spawn<T, F>(
    chunks: Chunks,
    normalize: F,
    settings: StageSettings,
    stop: CancellationToken,
) -> OrderedChunks<T>
where
    T: Send + 'static,
    F: Fn(&RawRecord) -> RecordOutcome<T> + Send + Sync + 'static,
{
    let StageSettings {
        pass,
        workers,
        queue_depth,
        read_timeout,
    } = settings;
    let workers = workers.max(1);
    let queue_depth = queue_depth.max(1);

    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Chunk>>(queue_depth);
    tokio::task::spawn_blocking(move || {
        for next in chunks {
            if stop.is_cancelled() {
                debug!("{} reader stopped at chunk boundary", pass);
                break;
            }
            let failed = next.is_err();
            if chunk_tx.blocking_send(next).is_err() || failed {
                break;
            }
        }
    });

    let (out_tx, out_rx) = mpsc::channel(queue_depth.max(workers));
    let shared_rx = Arc::new(Mutex::new(chunk_rx));
    let normalize = Arc::new(normalize);
    for worker in 0..workers {
        let rx = Arc::clone(&shared_rx);
        let out = out_tx.clone();
        let normalize = Arc::clone(&normalize);
        tokio::task::spawn_blocking(move || loop {
            let next = {
                let mut guard = rx.lock().unwrap_or_else(PoisonError::into_inner);
                guard.blocking_recv()
            };
            let Some(next) = next else {
                debug!("{} normalizer {} drained", pass, worker);
                break;
            };
            let result = next.map(|chunk| normalize_chunk(normalize.as_ref(), chunk, pass));
            if out.blocking_send(result).is_err() {
                break;
            }
        });
    }

    OrderedChunks {
        pass,
        rx: out_rx,
        read_timeout,
        next_index: 0,
        pending: BTreeMap::new(),
    }
}

fn normalize_chunk<T, F>(normalize: &F, chunk: Chunk, pass: PassName) -> NormalizedChunk<T>
where
    F: Fn(&RawRecord) -> RecordOutcome<T>,
{
    metrics::reader::chunk_read(pass.as_str(), chunk.records.len(), chunk.malformed as usize);

    let mut dropped = BTreeMap::new();
    if chunk.malformed > 0 {
        dropped.insert(DropReason::Malformed.as_str(), chunk.malformed);
    }
    let mut accepted = Vec::with_capacity(chunk.records.len());
    for record in &chunk.records {
        match normalize(record) {
            RecordOutcome::Accept(value) => accepted.push(value),
            RecordOutcome::Drop(reason) => *dropped.entry(reason.as_str()).or_insert(0) += 1,
        }
    }
    for (reason, count) in &dropped {
        metrics::normalize::record_dropped(pass.as_str(), *reason, *count);
    }

    NormalizedChunk {
        index: chunk.index,
        end_row: chunk.end_row(),
        rows: chunk.rows_covered(),
        accepted,
        dropped,
    }
}

/// Normalized chunks in source order.
pub(crate) struct OrderedChunks<T> {
    pass: PassName,
    rx: mpsc::Receiver<Result<NormalizedChunk<T>>>,
    read_timeout: Duration,
    next_index: u64,
    pending: BTreeMap<u64, NormalizedChunk<T>>,
}

impl<T> OrderedChunks<T> {
    /// The next chunk in source order, or `None` once the source is exhausted.
    ///
    /// Checks `cancel` before handing out each chunk. Waiting longer than the
    /// read timeout for the stages to produce anything is `SourceStalled`.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<NormalizedChunk<T>>> {
        loop {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled { pass: self.pass });
            }
            if let Some(chunk) = self.pending.remove(&self.next_index) {
                self.next_index += 1;
                return Ok(Some(chunk));
            }

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EtlError::Cancelled { pass: self.pass }),
                received = tokio::time::timeout(self.read_timeout, self.rx.recv()) => received,
            };
            match received {
                Err(_) => {
                    return Err(EtlError::SourceStalled {
                        waited: self.read_timeout,
                    })
                }
                Ok(None) => {
                    // Stages are done; anything left is already in order.
                    return Ok(self.pending.pop_first().map(|(_, chunk)| chunk));
                }
                Ok(Some(result)) => {
                    let chunk = result?;
                    self.pending.insert(chunk.index, chunk);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingestion::chunk_reader::{ChunkReader, SourceSchema};
    use std::io::Write;

    fn source(rows: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,value").unwrap();
        for i in 0..rows {
            writeln!(file, "{},{}", i, if i % 5 == 0 { "" } else { "x" }).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn settings(workers: usize) -> StageSettings {
        StageSettings {
            pass: PassName::Songs,
            workers,
            queue_depth: 2,
            read_timeout: Duration::from_secs(5),
        }
    }

    fn keep_non_empty(record: &RawRecord) -> RecordOutcome<u64> {
        match record.get("value") {
            Some("x") => RecordOutcome::Accept(record.row()),
            _ => RecordOutcome::Drop(DropReason::MissingSongKey),
        }
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_source_order_with_many_workers() {
        let file = source(103);
        let reader = ChunkReader::open(file.path(), 10, &SourceSchema::new().require("id")).unwrap();
        let mut stream = spawn(
            reader.chunks().unwrap(),
            keep_non_empty,
            settings(4),
            CancellationToken::new(),
        );

        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut rows = 0;
        let mut dropped = 0;
        while let Some(chunk) = stream.next(&cancel).await.unwrap() {
            assert_eq!(chunk.index as usize, seen.len());
            rows += chunk.rows;
            dropped += chunk.dropped.values().sum::<u64>();
            seen.push(chunk.accepted);
        }
        assert_eq!(seen.len(), 11);
        assert_eq!(rows, 103);
        assert_eq!(dropped, 21);
        let flat: Vec<u64> = seen.into_iter().flatten().collect();
        assert!(flat.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_next_chunk() {
        let file = source(50);
        let reader = ChunkReader::open(file.path(), 10, &SourceSchema::new()).unwrap();
        let mut stream = spawn(
            reader.chunks().unwrap(),
            keep_non_empty,
            settings(1),
            CancellationToken::new(),
        );
        let cancel = CancellationToken::new();
        assert!(stream.next(&cancel).await.unwrap().is_some());
        cancel.cancel();
        let err = stream.next(&cancel).await.unwrap_err();
        assert!(matches!(err, EtlError::Cancelled { pass: PassName::Songs }));
    }

    #[tokio::test]
    async fn test_slow_stages_surface_as_source_stalled() {
        let file = source(10);
        let reader = ChunkReader::open(file.path(), 10, &SourceSchema::new()).unwrap();
        let slow = |record: &RawRecord| {
            std::thread::sleep(Duration::from_millis(30));
            keep_non_empty(record)
        };
        let mut stream = spawn(
            reader.chunks().unwrap(),
            slow,
            StageSettings {
                read_timeout: Duration::from_millis(50),
                ..settings(1)
            },
            CancellationToken::new(),
        );

        let err = stream.next(&CancellationToken::new()).await.unwrap_err();
        match err {
            EtlError::SourceStalled { waited } => assert_eq!(waited, Duration::from_millis(50)),
            other => panic!("unexpected error: {other}"),
        }
    }
}
