// Pipeline processing: field normalization and entity deduplication

pub mod dedup;
pub mod normalize;
