use super::stages::NormalizedChunk;
use crate::error::PassName;
use crate::pipeline::storage::WriteReport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Write totals for one target table during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub batches: u64,
    pub attempted: u64,
    pub inserted: u64,
    pub ignored: u64,
}

impl TableSummary {
    pub(crate) fn record(&mut self, report: &WriteReport) {
        self.batches += 1;
        self.attempted += report.attempted;
        self.inserted += report.inserted;
        self.ignored += report.ignored();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass: PassName,
    pub skip_rule: &'static str,
    /// Source rows covered by this pass, including malformed ones.
    pub rows_read: u64,
    pub rows_dropped: BTreeMap<&'static str, u64>,
    pub entities_admitted: u64,
    pub entities_suppressed: u64,
    pub tables: BTreeMap<&'static str, TableSummary>,
    /// Set when the pass continued from a stored checkpoint.
    pub resumed_from_row: Option<u64>,
    pub elapsed_secs: f64,
}

impl PassSummary {
    pub(crate) fn new(pass: PassName, skip_rule: &'static str) -> Self {
        Self {
            pass,
            skip_rule,
            rows_read: 0,
            rows_dropped: BTreeMap::new(),
            entities_admitted: 0,
            entities_suppressed: 0,
            tables: BTreeMap::new(),
            resumed_from_row: None,
            elapsed_secs: 0.0,
        }
    }

    pub(crate) fn absorb<T>(&mut self, chunk: &NormalizedChunk<T>) {
        self.rows_read += chunk.rows;
        for (reason, count) in &chunk.dropped {
            *self.rows_dropped.entry(*reason).or_insert(0) += count;
        }
    }

    pub(crate) fn table(&mut self, table: &'static str) -> &mut TableSummary {
        self.tables.entry(table).or_default()
    }

    pub fn rows_dropped_total(&self) -> u64 {
        self.rows_dropped.values().sum()
    }

    /// Totals for `table`, zero if the pass never wrote to it.
    pub fn table_totals(&self, table: &str) -> TableSummary {
        self.tables.get(table).copied().unwrap_or_default()
    }
}

/// What a run did, pass by pass. Printed as JSON with `--summary-json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: PathBuf,
    pub songs: Option<PassSummary>,
    pub facts: Option<PassSummary>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub(crate) fn new(run_id: Uuid, source: PathBuf) -> Self {
        Self {
            run_id,
            source,
            songs: None,
            facts: None,
            elapsed_secs: 0.0,
        }
    }
}
