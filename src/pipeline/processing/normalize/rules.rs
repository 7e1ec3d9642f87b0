//! Named, ordered derivation rules for the ambiguous source fields.
//!
//! Each field that needs disambiguation has a small rule table. Rules are
//! evaluated top to bottom and the first one that yields a value wins, so the
//! precedence is the table order and nothing else.

use crate::config::SkipPolicy;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};

/// Values the extracts use for "no value".
pub const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

/// Raw `duration` values above this are already milliseconds.
pub const MS_THRESHOLD: f64 = 1000.0;

pub const MS_PER_SECOND: f64 = 1000.0;
pub const MS_PER_MINUTE: f64 = 60_000.0;

/// Offsets beyond a century of hours are treated as garbage.
const MAX_HOUR_OFFSET: f64 = 24.0 * 366.0 * 100.0;

/// Trims a raw field and maps missing-value tokens to `None`.
pub fn clean(raw: Option<&str>) -> Option<&str> {
    let value = raw?.trim();
    if MISSING_TOKENS.contains(&value) {
        None
    } else {
        Some(value)
    }
}

/// Generic numeric coercion. Non-numeric and non-finite values are absent.
pub fn coerce_f64(raw: Option<&str>) -> Option<f64> {
    clean(raw)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Integral coercion accepting float spellings such as `2018.0`.
pub fn coerce_i32(raw: Option<&str>) -> Option<i32> {
    let value = coerce_f64(raw)?;
    if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
        return None;
    }
    Some(value as i32)
}

/// Flag coercion: numeric spellings plus `true`/`false`.
pub fn coerce_flag(raw: Option<&str>) -> Option<i64> {
    let value = clean(raw)?;
    if value.eq_ignore_ascii_case("true") {
        return Some(1);
    }
    if value.eq_ignore_ascii_case("false") {
        return Some(0);
    }
    let n = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
    if n.fract() != 0.0 {
        return None;
    }
    Some(n as i64)
}

// Duration

/// Raw inputs of the duration rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationInputs<'a> {
    pub raw_duration: Option<&'a str>,
    pub minutes: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DurationRule {
    /// Raw `duration`: above `ms_threshold` it is taken as milliseconds,
    /// otherwise as seconds.
    RawDuration { ms_threshold: f64 },
    /// `track_duration_mins`, in minutes.
    Minutes,
}

/// Precedence of the duration derivation.
pub const DURATION_RULES: [DurationRule; 2] = [
    DurationRule::RawDuration {
        ms_threshold: MS_THRESHOLD,
    },
    DurationRule::Minutes,
];

impl DurationRule {
    pub fn name(&self) -> &'static str {
        match self {
            DurationRule::RawDuration { .. } => "raw_duration",
            DurationRule::Minutes => "minutes",
        }
    }

    pub fn apply(&self, inputs: &DurationInputs<'_>) -> Option<i64> {
        match self {
            DurationRule::RawDuration { ms_threshold } => {
                let value = coerce_f64(inputs.raw_duration)?;
                if value > *ms_threshold {
                    to_ms(value)
                } else {
                    to_ms(value * MS_PER_SECOND)
                }
            }
            DurationRule::Minutes => {
                let minutes = coerce_f64(inputs.minutes)?;
                to_ms(minutes * MS_PER_MINUTE)
            }
        }
    }
}

fn to_ms(value: f64) -> Option<i64> {
    let rounded = value.round();
    if rounded.is_finite() && rounded.abs() < i64::MAX as f64 {
        Some(rounded as i64)
    } else {
        None
    }
}

/// Applies [`DURATION_RULES`] in order.
pub fn derive_duration_ms(inputs: &DurationInputs<'_>) -> Option<i64> {
    DURATION_RULES.iter().find_map(|rule| rule.apply(inputs))
}

// Skipped flag

/// Raw inputs of the skip rules.
#[derive(Debug, Clone, Default)]
pub struct SkipInputs<'a> {
    pub not_skipped: Option<&'a str>,
    pub skip_stages: Vec<Option<&'a str>>,
}

/// The single skip encoding in force for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipRule {
    /// `not_skipped == 1` means not skipped; anything else means skipped.
    NotSkippedFlag,
    /// Skipped when any skip-stage indicator equals 1.
    AnySkipStage,
}

impl SkipRule {
    pub fn name(&self) -> &'static str {
        match self {
            SkipRule::NotSkippedFlag => "not_skipped_flag",
            SkipRule::AnySkipStage => "any_skip_stage",
        }
    }

    pub fn evaluate(&self, inputs: &SkipInputs<'_>) -> bool {
        match self {
            SkipRule::NotSkippedFlag => coerce_flag(inputs.not_skipped) != Some(1),
            SkipRule::AnySkipStage => inputs
                .skip_stages
                .iter()
                .any(|stage| coerce_flag(*stage) == Some(1)),
        }
    }
}

/// Picks the skip rule for a whole pass from which encodings the header has.
pub fn resolve_skip_rule(
    policy: SkipPolicy,
    has_not_skipped: bool,
    has_skip_stages: bool,
) -> SkipRule {
    match policy {
        SkipPolicy::NotSkippedFirst if has_not_skipped => SkipRule::NotSkippedFlag,
        SkipPolicy::NotSkippedFirst => SkipRule::AnySkipStage,
        SkipPolicy::SkipStagesFirst if has_skip_stages => SkipRule::AnySkipStage,
        SkipPolicy::SkipStagesFirst => SkipRule::NotSkippedFlag,
    }
}

// Timestamp

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
// `%.f` also matches a missing fraction.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

pub fn parse_date(raw: Option<&str>) -> Option<NaiveDateTime> {
    let value = clean(raw)?;
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.naive_utc())
}

/// Hour-of-day offset in hours. Missing or unparsable offsets are 0.
pub fn hour_offset(raw: Option<&str>) -> f64 {
    coerce_f64(raw)
        .filter(|h| h.abs() <= MAX_HOUR_OFFSET)
        .unwrap_or(0.0)
}

/// Date plus hour-of-day offset; `None` when the date does not parse.
pub fn derive_timestamp(date: Option<&str>, hour: Option<&str>) -> Option<NaiveDateTime> {
    let base = parse_date(date)?;
    let offset_ms = (hour_offset(hour) * 3_600_000.0).round() as i64;
    base.checked_add_signed(Duration::milliseconds(offset_ms))
}
