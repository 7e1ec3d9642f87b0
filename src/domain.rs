use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
}

/// Numeric audio descriptors. Absent values stay `None`, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioDescriptors {
    pub tempo: Option<f64>,
    pub valence: Option<f64>,
    pub energy: Option<f64>,
    pub danceability: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub liveness: Option<f64>,
    pub loudness: Option<f64>,
}

impl AudioDescriptors {
    /// Builds descriptors from values in `ColumnMap::descriptors` order.
    pub fn from_ordered(values: [Option<f64>; 8]) -> Self {
        let [tempo, valence, energy, danceability, acousticness, instrumentalness, liveness, loudness] =
            values;
        Self {
            tempo,
            valence,
            energy,
            danceability,
            acousticness,
            instrumentalness,
            liveness,
            loudness,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub song_id: String,
    pub release_year: Option<i32>,
    pub duration_ms: Option<i64>,
    pub descriptors: AudioDescriptors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenEvent {
    pub user_id: String,
    pub song_id: String,
    pub ts: NaiveDateTime,
    pub played_ms: Option<i64>,
    pub event_type: String,
    pub skipped: bool,
    pub session_id: String,
}
