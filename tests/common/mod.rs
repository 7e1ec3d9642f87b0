#![allow(dead_code)]

use anyhow::Result;
use music_etl::config::EtlConfig;
use rusqlite::Connection;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const HEADER: &str = "session_id,track_id,date,hour_of_day,duration,not_skipped,skip_1,skip_2,skip_3,\
release_year,tempo,valence,energy,danceability,acousticness,instrumentalness,liveness,loudness";

const SCHEMA: &str = include_str!("../fixtures/schema.sql");

/// A temp dir holding a source extract and a provisioned target database.
pub struct Workspace {
    pub dir: TempDir,
    pub source: PathBuf,
    pub database: PathBuf,
}

impl Workspace {
    pub fn new<S: AsRef<str>>(header: &str, rows: &[S]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("sessions.csv");
        let mut file = std::fs::File::create(&source)?;
        writeln!(file, "{}", header)?;
        for row in rows {
            writeln!(file, "{}", row.as_ref())?;
        }
        file.flush()?;

        let database = dir.path().join("analytics.db");
        Connection::open(&database)?.execute_batch(SCHEMA)?;
        Ok(Self {
            dir,
            source,
            database,
        })
    }

    pub fn config(&self, chunk_size: usize, batch_size: usize) -> EtlConfig {
        EtlConfig {
            source: self.source.clone(),
            database: self.database.clone(),
            chunk_size,
            batch_size,
            write_timeout_secs: 10,
            read_timeout_secs: 10,
            ..EtlConfig::default()
        }
    }

    pub fn count(&self, sql: &str) -> Result<i64> {
        count(&self.database, sql)
    }
}

pub fn count(database: &Path, sql: &str) -> Result<i64> {
    let conn = Connection::open(database)?;
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

/// One source row with default descriptors.
pub fn row(session: &str, track: &str, date: &str, hour: &str, duration: &str, not_skipped: &str) -> String {
    format!(
        "{},{},{},{},{},{},0,0,0,2018,120.0,0.5,0.6,0.7,0.1,0.0,0.2,-5.5",
        session, track, date, hour, duration, not_skipped
    )
}
