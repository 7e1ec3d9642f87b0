// Pipeline ingestion: windowed source reads, source fingerprints, and the facts checkpoint

pub mod checkpoint;
pub mod chunk_reader;
pub mod fingerprint;
