//! Metrics for the music ETL.
//!
//! Recording is always cheap: without an installed recorder the `metrics`
//! macros are no-ops. `init` installs the Prometheus exporter only when
//! `ETL_METRICS_PORT` is set.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

pub const METRICS_PORT_ENV: &str = "ETL_METRICS_PORT";

/// All metric names used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Reader
    ReaderChunksRead,
    ReaderRowsRead,
    ReaderRowsMalformed,

    // Normalize
    NormalizeRecordsDropped,
    NormalizeFieldsSkipped,

    // Dedup
    DedupAdmitted,
    DedupSuppressed,

    // Sink
    SinkBatchesWritten,
    SinkBatchesFailed,
    SinkRowsInserted,
    SinkDuplicatesIgnored,
    SinkBatchDuration,

    // Orchestrator
    PassCompleted,
    PassFailed,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::ReaderChunksRead => "etl_reader_chunks_read_total",
            MetricName::ReaderRowsRead => "etl_reader_rows_read_total",
            MetricName::ReaderRowsMalformed => "etl_reader_rows_malformed_total",

            MetricName::NormalizeRecordsDropped => "etl_normalize_records_dropped_total",
            MetricName::NormalizeFieldsSkipped => "etl_normalize_fields_skipped_total",

            MetricName::DedupAdmitted => "etl_dedup_admitted_total",
            MetricName::DedupSuppressed => "etl_dedup_suppressed_total",

            MetricName::SinkBatchesWritten => "etl_sink_batches_written_total",
            MetricName::SinkBatchesFailed => "etl_sink_batches_failed_total",
            MetricName::SinkRowsInserted => "etl_sink_rows_inserted_total",
            MetricName::SinkDuplicatesIgnored => "etl_sink_duplicates_ignored_total",
            MetricName::SinkBatchDuration => "etl_sink_batch_duration_seconds",

            MetricName::PassCompleted => "etl_pass_completed_total",
            MetricName::PassFailed => "etl_pass_failed_total",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            ReaderChunksRead,
            ReaderRowsRead,
            ReaderRowsMalformed,
            NormalizeRecordsDropped,
            NormalizeFieldsSkipped,
            DedupAdmitted,
            DedupSuppressed,
            SinkBatchesWritten,
            SinkBatchesFailed,
            SinkRowsInserted,
            SinkDuplicatesIgnored,
            SinkBatchDuration,
            PassCompleted,
            PassFailed,
        ]
        .into_iter()
    }
}

/// Install the Prometheus exporter if `ETL_METRICS_PORT` names a port.
///
/// Returns the bound address, or `None` when metrics export is disabled.
/// Must be called from within a tokio runtime.
pub fn init() -> Result<Option<SocketAddr>, Box<dyn std::error::Error>> {
    let Ok(raw) = std::env::var(METRICS_PORT_ENV) else {
        info!("Metrics exporter disabled ({} not set)", METRICS_PORT_ENV);
        return Ok(None);
    };
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|e| format!("invalid {}={:?}: {}", METRICS_PORT_ENV, raw, e))?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))?;

    info!("Metrics exporter listening on {}", addr);
    Ok(Some(addr))
}

// ============================================================================
// Reader Metrics
// ============================================================================

pub mod reader {
    use super::MetricName;

    /// Record a chunk handed downstream, with its row counts.
    pub fn chunk_read(pass: &'static str, rows: usize, malformed: usize) {
        ::metrics::counter!(MetricName::ReaderChunksRead.as_str(), "pass" => pass).increment(1);
        ::metrics::counter!(MetricName::ReaderRowsRead.as_str(), "pass" => pass)
            .increment(rows as u64);
        if malformed > 0 {
            ::metrics::counter!(MetricName::ReaderRowsMalformed.as_str(), "pass" => pass)
                .increment(malformed as u64);
        }
    }
}

// ============================================================================
// Normalize Metrics
// ============================================================================

pub mod normalize {
    use super::MetricName;

    /// A row was excluded from a pass.
    pub fn record_dropped(pass: &'static str, reason: &'static str, count: u64) {
        ::metrics::counter!(
            MetricName::NormalizeRecordsDropped.as_str(),
            "pass" => pass,
            "reason" => reason
        )
        .increment(count);
    }

    /// An optional field was present but unusable and was nulled.
    pub fn field_skipped(field: &'static str) {
        ::metrics::counter!(MetricName::NormalizeFieldsSkipped.as_str(), "field" => field)
            .increment(1);
    }
}

// ============================================================================
// Dedup Metrics
// ============================================================================

pub mod dedup {
    use super::MetricName;

    pub fn admitted(kind: &'static str) {
        ::metrics::counter!(MetricName::DedupAdmitted.as_str(), "kind" => kind).increment(1);
    }

    pub fn suppressed(kind: &'static str) {
        ::metrics::counter!(MetricName::DedupSuppressed.as_str(), "kind" => kind).increment(1);
    }
}

// ============================================================================
// Sink Metrics
// ============================================================================

pub mod sink {
    use super::MetricName;

    /// Record a committed batch.
    pub fn batch_written(table: &'static str, attempted: u64, inserted: u64, secs: f64) {
        ::metrics::counter!(MetricName::SinkBatchesWritten.as_str(), "table" => table).increment(1);
        ::metrics::counter!(MetricName::SinkRowsInserted.as_str(), "table" => table)
            .increment(inserted);
        let ignored = attempted.saturating_sub(inserted);
        if ignored > 0 {
            ::metrics::counter!(MetricName::SinkDuplicatesIgnored.as_str(), "table" => table)
                .increment(ignored);
        }
        ::metrics::histogram!(MetricName::SinkBatchDuration.as_str(), "table" => table).record(secs);
    }

    pub fn batch_failed(table: &'static str) {
        ::metrics::counter!(MetricName::SinkBatchesFailed.as_str(), "table" => table).increment(1);
    }
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

pub mod pass {
    use super::MetricName;

    pub fn completed(pass: &'static str) {
        ::metrics::counter!(MetricName::PassCompleted.as_str(), "pass" => pass).increment(1);
    }

    pub fn failed(pass: &'static str) {
        ::metrics::counter!(MetricName::PassFailed.as_str(), "pass" => pass).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique_and_prefixed() {
        let names: HashSet<&str> = MetricName::all_metrics().map(|m| m.as_str()).collect();
        assert_eq!(names.len(), MetricName::all_metrics().count());
        assert!(names.iter().all(|n| n.starts_with("etl_")));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        reader::chunk_read("songs", 10, 1);
        normalize::record_dropped("facts", "missing_timestamp", 2);
        dedup::admitted("song");
        sink::batch_written("songs", 5, 3, 0.01);
    }
}
