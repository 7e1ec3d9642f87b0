//! Windowed streaming reads over the delimited source extract.
//!
//! A [`ChunkReader`] validates the header once at open time and then hands out
//! fresh [`Chunks`] iterators, one per pass. Each iterator holds at most one
//! window of rows in memory.

use crate::config::ColumnMap;
use crate::error::{EtlError, Result};
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Columns that must be present in the header, checked before the first window.
#[derive(Debug, Clone, Default)]
pub struct SourceSchema {
    required: Vec<String>,
    /// Each group needs at least one of its columns.
    one_of: Vec<Vec<String>>,
}

impl SourceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, column: impl Into<String>) -> Self {
        self.required.push(column.into());
        self
    }

    pub fn require_any<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.one_of.push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// The session extract schema for the given column names.
    pub fn for_columns(columns: &ColumnMap) -> Self {
        let mut schema = Self::new();
        for col in columns.always_required() {
            schema = schema.require(col);
        }
        let mut skip_group = vec![columns.not_skipped.clone()];
        skip_group.extend(columns.skip_stages.iter().cloned());
        schema
            .require_any([columns.duration.clone(), columns.duration_minutes.clone()])
            .require_any(skip_group)
    }

    /// Returns the human-readable list of unmet requirements.
    pub fn missing(&self, header: &SourceHeader) -> Vec<String> {
        let mut missing: Vec<String> = self
            .required
            .iter()
            .filter(|c| !header.contains(c))
            .cloned()
            .collect();
        for group in &self.one_of {
            if !group.iter().any(|c| header.contains(c)) {
                missing.push(format!("one of [{}]", group.join(", ")));
            }
        }
        missing
    }
}

/// Column names of the source, in source order.
#[derive(Debug, Clone)]
pub struct SourceHeader {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl SourceHeader {
    pub fn new(columns: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            // First occurrence wins on duplicated header names.
            index.entry(name.clone()).or_insert(i);
        }
        Self { columns, index }
    }

    fn from_record(record: &StringRecord) -> Self {
        Self::new(record.iter().map(|c| c.trim().to_string()).collect())
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// One source row, with field access by column name or resolved position.
#[derive(Debug, Clone)]
pub struct RawRecord {
    row: u64,
    header: Arc<SourceHeader>,
    fields: StringRecord,
}

impl RawRecord {
    pub fn new(row: u64, header: Arc<SourceHeader>, fields: StringRecord) -> Self {
        Self { row, header, fields }
    }

    /// Zero-based data row number within the source (header excluded).
    pub fn row(&self) -> u64 {
        self.row
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.field(self.header.position(column))
    }

    /// Field at an already-resolved position. Rows shorter than the header
    /// yield `None` for their missing trailing fields.
    pub fn field(&self, position: Option<usize>) -> Option<&str> {
        position.and_then(|i| self.fields.get(i))
    }
}

/// A bounded, contiguous window of source rows.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u64,
    pub first_row: u64,
    pub records: Vec<RawRecord>,
    /// Rows in this window the CSV layer could not decode.
    pub malformed: u64,
}

impl Chunk {
    /// Source rows covered by this window, decoded or not.
    pub fn rows_covered(&self) -> u64 {
        self.records.len() as u64 + self.malformed
    }

    /// The source row offset just past this window.
    pub fn end_row(&self) -> u64 {
        self.first_row + self.rows_covered()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
    window: usize,
    header: Arc<SourceHeader>,
}

impl ChunkReader {
    /// Opens the source, reads its header, and fails fast on a missing column.
    pub fn open<P: AsRef<Path>>(path: P, window: usize, schema: &SourceSchema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if window == 0 {
            return Err(EtlError::Config("chunk window must be positive".into()));
        }
        let mut reader = open_csv(&path)?;
        let header = read_header(&path, &mut reader)?;

        let missing = schema.missing(&header);
        if !missing.is_empty() {
            warn!("Source {} is missing columns: {:?}", path.display(), missing);
            return Err(EtlError::SchemaMismatch { missing });
        }
        debug!(
            "Opened {} with {} columns, window {}",
            path.display(),
            header.columns().len(),
            window
        );

        Ok(Self {
            path,
            window,
            header: Arc::new(header),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn header(&self) -> &Arc<SourceHeader> {
        &self.header
    }

    /// A fresh pass over the source from its first data row.
    pub fn chunks(&self) -> Result<Chunks> {
        self.chunks_from(0)
    }

    /// A fresh pass that silently consumes the first `skip_rows` data rows.
    pub fn chunks_from(&self, skip_rows: u64) -> Result<Chunks> {
        let mut reader = open_csv(&self.path)?;
        // Re-read the header so the iterator starts on the first data row.
        read_header(&self.path, &mut reader)?;
        let mut chunks = Chunks {
            path: self.path.clone(),
            reader,
            header: Arc::clone(&self.header),
            window: self.window,
            next_row: 0,
            next_index: 0,
            done: false,
        };
        chunks.discard_rows(skip_rows)?;
        Ok(chunks)
    }
}

fn open_csv(path: &Path) -> Result<csv::Reader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| EtlError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file)))
}

fn read_header(path: &Path, reader: &mut csv::Reader<BufReader<File>>) -> Result<SourceHeader> {
    let record = reader.headers().map_err(|e| EtlError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: format!("unreadable header: {}", e),
    })?;
    Ok(SourceHeader::from_record(record))
}

/// Lazy, finite sequence of windows for one pass.
pub struct Chunks {
    path: PathBuf,
    reader: csv::Reader<BufReader<File>>,
    header: Arc<SourceHeader>,
    window: usize,
    next_row: u64,
    next_index: u64,
    done: bool,
}

enum RowRead {
    Record(StringRecord),
    Malformed,
    Eof,
}

impl Chunks {
    /// Row offset of the next row this iterator will read.
    pub fn position(&self) -> u64 {
        self.next_row
    }

    fn read_row(&mut self) -> Result<RowRead> {
        let mut record = StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => Ok(RowRead::Record(record)),
            Ok(false) => Ok(RowRead::Eof),
            Err(e) if e.is_io_error() => Err(EtlError::SourceUnavailable {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            Err(e) => {
                debug!("Malformed source row {}: {}", self.next_row, e);
                Ok(RowRead::Malformed)
            }
        }
    }

    fn discard_rows(&mut self, rows: u64) -> Result<()> {
        while self.next_row < rows {
            match self.read_row()? {
                RowRead::Eof => {
                    self.done = true;
                    break;
                }
                RowRead::Record(_) | RowRead::Malformed => self.next_row += 1,
            }
        }
        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let first_row = self.next_row;
        let mut records = Vec::with_capacity(self.window);
        let mut malformed = 0;

        while records.len() + (malformed as usize) < self.window {
            match self.read_row()? {
                RowRead::Record(fields) => {
                    records.push(RawRecord::new(
                        self.next_row,
                        Arc::clone(&self.header),
                        fields,
                    ));
                }
                RowRead::Malformed => malformed += 1,
                RowRead::Eof => {
                    self.done = true;
                    break;
                }
            }
            self.next_row += 1;
        }

        if records.is_empty() && malformed == 0 {
            return Ok(None);
        }
        let chunk = Chunk {
            index: self.next_index,
            first_row,
            records,
            malformed,
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

impl Iterator for Chunks {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn key_schema() -> SourceSchema {
        SourceSchema::new().require("session_id").require("track_id")
    }

    #[test]
    fn test_windows_are_bounded_and_cover_every_row() {
        let mut body = String::from("session_id,track_id\n");
        for i in 0..7 {
            body.push_str(&format!("s{},t{}\n", i, i));
        }
        let file = write_source(&body);

        let reader = ChunkReader::open(file.path(), 3, &key_schema()).unwrap();
        let chunks: Vec<Chunk> = reader.chunks().unwrap().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.records.len()).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert_eq!(chunks[1].first_row, 3);
        assert_eq!(chunks[2].records[0].get("track_id"), Some("t6"));
        assert_eq!(chunks[2].records[0].row(), 6);
    }

    #[test]
    fn test_reader_restarts_from_the_beginning() {
        let file = write_source("session_id,track_id\na,1\nb,2\n");
        let reader = ChunkReader::open(file.path(), 10, &key_schema()).unwrap();

        let first: usize = reader.chunks().unwrap().map(|c| c.unwrap().records.len()).sum();
        let second: usize = reader.chunks().unwrap().map(|c| c.unwrap().records.len()).sum();
        assert_eq!(first, 2);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_chunks_from_skips_leading_rows() {
        let file = write_source("session_id,track_id\na,1\nb,2\nc,3\n");
        let reader = ChunkReader::open(file.path(), 10, &key_schema()).unwrap();

        let chunk = reader.chunks_from(2).unwrap().next().unwrap().unwrap();
        assert_eq!(chunk.first_row, 2);
        assert_eq!(chunk.records.len(), 1);
        assert_eq!(chunk.records[0].get("session_id"), Some("c"));
    }

    #[test]
    fn test_chunks_from_past_end_is_empty() {
        let file = write_source("session_id,track_id\na,1\nb,2\n");
        let reader = ChunkReader::open(file.path(), 10, &key_schema()).unwrap();

        let mut chunks = reader.chunks_from(5).unwrap();
        assert!(chunks.next().is_none());
        assert_eq!(chunks.position(), 2);
    }

    #[test]
    fn test_missing_column_fails_before_any_window() {
        let file = write_source("session_id,date\na,2018-07-15\n");
        let err = ChunkReader::open(file.path(), 10, &key_schema()).unwrap_err();
        match err {
            EtlError::SchemaMismatch { missing } => assert_eq!(missing, vec!["track_id"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_one_of_group_reports_alternatives() {
        let file = write_source("session_id,track_id\na,1\n");
        let schema = key_schema().require_any(["duration", "track_duration_mins"]);
        let err = ChunkReader::open(file.path(), 10, &schema).unwrap_err();
        match err {
            EtlError::SchemaMismatch { missing } => {
                assert_eq!(missing, vec!["one of [duration, track_duration_mins]"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChunkReader::open(dir.path().join("nope.csv"), 10, &key_schema()).unwrap_err();
        assert!(matches!(err, EtlError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_short_rows_yield_absent_fields() {
        let file = write_source("session_id,track_id,tempo\na,1\n");
        let reader = ChunkReader::open(file.path(), 10, &key_schema()).unwrap();
        let chunk = reader.chunks().unwrap().next().unwrap().unwrap();
        assert_eq!(chunk.records[0].get("track_id"), Some("1"));
        assert_eq!(chunk.records[0].get("tempo"), None);
    }
}
