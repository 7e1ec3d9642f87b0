// Loading pipeline: ingestion, processing, storage, and the pass orchestrator

pub mod ingestion;
pub mod orchestrator;
pub mod processing;
pub mod storage;

pub use orchestrator::{
    check_source, Orchestrator, PassSelection, PassSummary, PipelineState, RunOptions, RunSummary,
    SourceCheck,
};
