use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The two streaming passes of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassName {
    Songs,
    Facts,
}

impl PassName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassName::Songs => "songs",
            PassName::Facts => "facts",
        }
    }
}

impl fmt::Display for PassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal, run-level failures. Row and field problems never end up here.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("source schema mismatch: missing required column(s) {missing:?}")]
    SchemaMismatch { missing: Vec<String> },

    #[error("no chunk arrived from the source within {waited:?}")]
    SourceStalled { waited: Duration },

    #[error("batch {batch} of `{table}` failed to persist: {cause}")]
    PersistenceFailure {
        table: &'static str,
        batch: u64,
        cause: String,
    },

    #[error("{pass} pass cancelled by operator")]
    Cancelled { pass: PassName },

    #[error(
        "facts checkpoint exists for this source ({rows_committed} rows in {batches_committed} batches, completed: {completed}); \
         re-running would duplicate listen events. Pass --resume or --force-restart"
    )]
    CheckpointConflict {
        rows_committed: u64,
        batches_committed: u64,
        completed: bool,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EtlError {
    pub fn persistence(table: &'static str, batch: u64, cause: impl fmt::Display) -> Self {
        EtlError::PersistenceFailure {
            table,
            batch,
            cause: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

/// A run that reached the `Failed` state, tagged with the pass that failed.
#[derive(Error, Debug)]
#[error("{pass} pass failed: {error}")]
pub struct PipelineFailure {
    pub pass: PassName,
    #[source]
    pub error: EtlError,
}

impl PipelineFailure {
    pub fn new(pass: PassName, error: EtlError) -> Self {
        Self { pass, error }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, EtlError::Cancelled { .. })
    }
}
