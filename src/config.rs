use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const MAX_BATCH_SIZE: usize = 50_000;

/// Which skip encoding wins when the extract carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// `not_skipped` when the column exists, `skip_1..3` otherwise.
    #[default]
    #[value(name = "not_skipped_first")]
    NotSkippedFirst,
    /// `skip_1..3` when any of them exists, `not_skipped` otherwise.
    #[value(name = "skip_stages_first")]
    SkipStagesFirst,
}

impl FromStr for SkipPolicy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "not_skipped_first" => Ok(SkipPolicy::NotSkippedFirst),
            "skip_stages_first" => Ok(SkipPolicy::SkipStagesFirst),
            other => Err(EtlError::Config(format!("unknown skip policy '{}'", other))),
        }
    }
}

/// Source column names. Defaults match the canonical session extract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub session: String,
    pub track: String,
    pub date: String,
    pub hour_of_day: String,
    pub duration: String,
    pub duration_minutes: String,
    pub not_skipped: String,
    pub skip_stages: Vec<String>,
    pub release_year: String,
    pub tempo: String,
    pub valence: String,
    pub energy: String,
    pub danceability: String,
    pub acousticness: String,
    pub instrumentalness: String,
    pub liveness: String,
    pub loudness: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            session: "session_id".to_string(),
            track: "track_id".to_string(),
            date: "date".to_string(),
            hour_of_day: "hour_of_day".to_string(),
            duration: "duration".to_string(),
            duration_minutes: "track_duration_mins".to_string(),
            not_skipped: "not_skipped".to_string(),
            skip_stages: vec![
                "skip_1".to_string(),
                "skip_2".to_string(),
                "skip_3".to_string(),
            ],
            release_year: "release_year".to_string(),
            tempo: "tempo".to_string(),
            valence: "valence".to_string(),
            energy: "energy".to_string(),
            danceability: "danceability".to_string(),
            acousticness: "acousticness".to_string(),
            instrumentalness: "instrumentalness".to_string(),
            liveness: "liveness".to_string(),
            loudness: "loudness".to_string(),
        }
    }
}

impl ColumnMap {
    /// The eight audio descriptor columns, in `Song` field order.
    pub fn descriptors(&self) -> [&str; 8] {
        [
            self.tempo.as_str(),
            self.valence.as_str(),
            self.energy.as_str(),
            self.danceability.as_str(),
            self.acousticness.as_str(),
            self.instrumentalness.as_str(),
            self.liveness.as_str(),
            self.loudness.as_str(),
        ]
    }

    /// Columns that must all be present in the header.
    pub fn always_required(&self) -> Vec<&str> {
        let mut cols = vec![
            self.session.as_str(),
            self.track.as_str(),
            self.date.as_str(),
            self.hour_of_day.as_str(),
        ];
        cols.extend(self.descriptors());
        cols
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub source: PathBuf,
    pub database: PathBuf,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub workers: usize,
    pub queue_depth: usize,
    pub max_connections: usize,
    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub skip_policy: SkipPolicy,
    pub event_type: String,
    pub columns: ColumnMap,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("data_raw/data_final.csv"),
            database: PathBuf::from("music_analytics.db"),
            chunk_size: 50_000,
            batch_size: 10_000,
            workers: 2,
            queue_depth: 4,
            max_connections: 4,
            write_timeout_secs: 60,
            read_timeout_secs: 120,
            skip_policy: SkipPolicy::default(),
            event_type: "play".to_string(),
            columns: ColumnMap::default(),
        }
    }
}

impl EtlConfig {
    /// Defaults, overlaid with the TOML file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|e| {
            EtlError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EtlConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Applies `ETL_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ETL_SOURCE") {
            self.source = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_DATABASE") {
            self.database = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_CHUNK_SIZE") {
            self.chunk_size = parse_env("ETL_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("ETL_BATCH_SIZE") {
            self.batch_size = parse_env("ETL_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("ETL_MAX_CONNECTIONS") {
            self.max_connections = parse_env("ETL_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("ETL_SKIP_POLICY") {
            self.skip_policy = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::Config("chunk_size must be positive".into()));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(EtlError::Config(format!(
                "batch_size must be within 1..={}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.workers == 0 || self.queue_depth == 0 {
            return Err(EtlError::Config(
                "workers and queue_depth must be positive".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(EtlError::Config("max_connections must be positive".into()));
        }
        if self.write_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(EtlError::Config("timeouts must be positive".into()));
        }
        if self.columns.skip_stages.is_empty() {
            return Err(EtlError::Config(
                "columns.skip_stages must name at least one column".into(),
            ));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EtlError::Config(format!("{} has an invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EtlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.skip_policy, SkipPolicy::NotSkippedFirst);
        assert_eq!(config.event_type, "play");
    }

    #[test]
    fn test_toml_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etl.toml");
        fs::write(
            &path,
            r#"
            batch_size = 2000
            skip_policy = "skip_stages_first"

            [columns]
            session = "user_session"
            "#,
        )
        .unwrap();

        let config = EtlConfig::load(Some(&path)).unwrap();
        assert_eq!(config.batch_size, 2000);
        assert_eq!(config.chunk_size, 50_000);
        assert_eq!(config.skip_policy, SkipPolicy::SkipStagesFirst);
        assert_eq!(config.columns.session, "user_session");
        assert_eq!(config.columns.track, "track_id");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ETL_BATCH_SIZE", "1500"),
            ("ETL_SKIP_POLICY", "skip_stages_first"),
            ("ETL_DATABASE", "/tmp/other.db"),
        ]
        .into_iter()
        .collect();

        let mut config = EtlConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.batch_size, 1500);
        assert_eq!(config.skip_policy, SkipPolicy::SkipStagesFirst);
        assert_eq!(config.database, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_invalid_env_value_is_a_config_error() {
        let mut config = EtlConfig::default();
        let err = config
            .apply_overrides(|k| (k == "ETL_CHUNK_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_out_of_range_batch() {
        let config = EtlConfig {
            batch_size: MAX_BATCH_SIZE + 1,
            ..EtlConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EtlConfig {
            max_connections: 0,
            ..EtlConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
