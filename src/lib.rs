pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;

pub use config::{ColumnMap, EtlConfig, SkipPolicy};
pub use error::{EtlError, PassName, PipelineFailure, Result};
