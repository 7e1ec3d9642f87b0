pub mod rules;

use crate::config::{ColumnMap, SkipPolicy};
use crate::domain::{AudioDescriptors, ListenEvent, Song, User};
use crate::observability::metrics;
use crate::pipeline::ingestion::chunk_reader::{RawRecord, SourceHeader};
use rules::{DurationInputs, SkipInputs, SkipRule};
use serde::Serialize;

/// Why a row was excluded from a pass. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MissingSongKey,
    MissingUserKey,
    MissingTimestamp,
    /// The CSV layer could not decode the row at all.
    Malformed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MissingSongKey => "missing_song_key",
            DropReason::MissingUserKey => "missing_user_key",
            DropReason::MissingTimestamp => "missing_timestamp",
            DropReason::Malformed => "malformed",
        }
    }
}

/// Per-record result of normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome<T> {
    Accept(T),
    Drop(DropReason),
}

/// A listen event and the user it references, tagged with its source row.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenCandidate {
    pub row: u64,
    pub user: User,
    pub listen: ListenEvent,
}

/// Header positions resolved once per pass.
#[derive(Debug, Clone)]
struct ColumnIndex {
    session: Option<usize>,
    track: Option<usize>,
    date: Option<usize>,
    hour_of_day: Option<usize>,
    duration: Option<usize>,
    duration_minutes: Option<usize>,
    not_skipped: Option<usize>,
    skip_stages: Vec<usize>,
    release_year: Option<usize>,
    descriptors: [Option<usize>; 8],
}

impl ColumnIndex {
    fn resolve(header: &SourceHeader, columns: &ColumnMap) -> Self {
        Self {
            session: header.position(&columns.session),
            track: header.position(&columns.track),
            date: header.position(&columns.date),
            hour_of_day: header.position(&columns.hour_of_day),
            duration: header.position(&columns.duration),
            duration_minutes: header.position(&columns.duration_minutes),
            not_skipped: header.position(&columns.not_skipped),
            skip_stages: columns
                .skip_stages
                .iter()
                .filter_map(|c| header.position(c))
                .collect(),
            release_year: header.position(&columns.release_year),
            descriptors: columns.descriptors().map(|c| header.position(c)),
        }
    }
}

/// Maps raw rows to typed songs and listen events.
///
/// Built once per pass from the source header; the skip rule is fixed for the
/// lifetime of the normalizer so a pass never mixes skip encodings.
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    index: ColumnIndex,
    skip_rule: SkipRule,
    event_type: String,
}

impl FieldNormalizer {
    pub fn for_header(
        header: &SourceHeader,
        columns: &ColumnMap,
        policy: SkipPolicy,
        event_type: impl Into<String>,
    ) -> Self {
        let index = ColumnIndex::resolve(header, columns);
        let skip_rule = rules::resolve_skip_rule(
            policy,
            index.not_skipped.is_some(),
            !index.skip_stages.is_empty(),
        );
        Self {
            index,
            skip_rule,
            event_type: event_type.into(),
        }
    }

    pub fn skip_rule(&self) -> SkipRule {
        self.skip_rule
    }

    fn key(&self, record: &RawRecord, position: Option<usize>) -> Option<String> {
        rules::clean(record.field(position)).map(str::to_string)
    }

    fn numeric(&self, record: &RawRecord, position: Option<usize>, field: &'static str) -> Option<f64> {
        let raw = record.field(position);
        let value = rules::coerce_f64(raw);
        if value.is_none() && rules::clean(raw).is_some() {
            metrics::normalize::field_skipped(field);
        }
        value
    }

    fn duration_ms(&self, record: &RawRecord) -> Option<i64> {
        rules::derive_duration_ms(&DurationInputs {
            raw_duration: record.field(self.index.duration),
            minutes: record.field(self.index.duration_minutes),
        })
    }

    /// Song entity candidate for the songs pass.
    pub fn normalize_song(&self, record: &RawRecord) -> RecordOutcome<Song> {
        let Some(song_id) = self.key(record, self.index.track) else {
            return RecordOutcome::Drop(DropReason::MissingSongKey);
        };

        const DESCRIPTOR_FIELDS: [&str; 8] = [
            "tempo",
            "valence",
            "energy",
            "danceability",
            "acousticness",
            "instrumentalness",
            "liveness",
            "loudness",
        ];
        let mut values = [None; 8];
        for (slot, (position, field)) in values
            .iter_mut()
            .zip(self.index.descriptors.iter().zip(DESCRIPTOR_FIELDS))
        {
            *slot = self.numeric(record, *position, field);
        }

        let release_year = rules::coerce_i32(record.field(self.index.release_year));

        RecordOutcome::Accept(Song {
            song_id,
            release_year,
            duration_ms: self.duration_ms(record),
            descriptors: AudioDescriptors::from_ordered(values),
        })
    }

    /// Listen event plus user key for the facts pass.
    pub fn normalize_listen(&self, record: &RawRecord) -> RecordOutcome<ListenCandidate> {
        let Some(song_id) = self.key(record, self.index.track) else {
            return RecordOutcome::Drop(DropReason::MissingSongKey);
        };
        let Some(session) = self.key(record, self.index.session) else {
            return RecordOutcome::Drop(DropReason::MissingUserKey);
        };
        let Some(ts) = rules::derive_timestamp(
            record.field(self.index.date),
            record.field(self.index.hour_of_day),
        ) else {
            return RecordOutcome::Drop(DropReason::MissingTimestamp);
        };

        let skipped = self.skip_rule.evaluate(&SkipInputs {
            not_skipped: record.field(self.index.not_skipped),
            skip_stages: self
                .index
                .skip_stages
                .iter()
                .map(|p| record.field(Some(*p)))
                .collect(),
        });

        RecordOutcome::Accept(ListenCandidate {
            row: record.row(),
            user: User {
                user_id: session.clone(),
            },
            listen: ListenEvent {
                user_id: session.clone(),
                song_id,
                ts,
                played_ms: self.duration_ms(record),
                event_type: self.event_type.clone(),
                skipped,
                session_id: session,
            },
        })
    }
}
