//! Timestamp parsing and date ranges.
//!
//! Timestamps are naive (no timezone), matching how data services label their
//! time axes. A trailing `Z` is accepted and dropped.

use crate::source::Frequency;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid timestamp '{input}': expected YYYY-MM-DD or YYYY-MM-DDTHH:MM[:SS]")]
pub struct TimestampError {
    pub input: String,
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a date or datetime string.
pub fn parse_timestamp(input: &str) -> Result<NaiveDateTime, TimestampError> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_suffix('Z').unwrap_or(trimmed);

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| TimestampError {
            input: input.to_string(),
        })
}

/// Inclusive range from `start` to `end` stepped by `freq`.
///
/// Empty when `start > end`. Month and year steps are calendar-aware and are
/// always taken from `start`, so a range starting on the 31st clamps to the end
/// of shorter months without drifting.
pub fn date_range(start: NaiveDateTime, end: NaiveDateTime, freq: Frequency) -> Vec<NaiveDateTime> {
    let mut out = Vec::new();
    let mut k = 0u32;
    while let Some(t) = freq.nth_after(start, k) {
        if t > end {
            break;
        }
        out.push(t);
        k += 1;
    }
    out
}

/// Inclusive daily range.
pub fn daily_range(start: NaiveDateTime, end: NaiveDateTime) -> Vec<NaiveDateTime> {
    date_range(start, end, Frequency::daily())
}

/// Render a timestamp the way it appears in logs and bare `{t}` fields.
pub fn display(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}
