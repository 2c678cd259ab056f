//! CF-convention time coordinates and nearest-timestamp selection.
//!
//! Remote datasets expose time as numeric offsets with a units string such as
//! `days since 1981-01-01 00:00:00`. Only the standard (proleptic Gregorian)
//! calendar is handled.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CfTimeError {
    #[error("unsupported time units '{0}'")]
    UnsupportedUnits(String),
    #[error("invalid reference date in time units '{0}'")]
    InvalidReference(String),
    #[error("time offset {0} is out of range")]
    OutOfRange(f64),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NearestError {
    #[error("dataset has no timestamps")]
    EmptyAxis,
    #[error("nearest timestamp to {requested} is {nearest}, further than the {tolerance} tolerance")]
    OutOfTolerance {
        requested: NaiveDateTime,
        nearest: NaiveDateTime,
        tolerance: Duration,
    },
}

/// `<unit> since <reference>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfUnits {
    millis_per_unit: i64,
    reference: NaiveDateTime,
}

impl CfUnits {
    pub fn parse(units: &str) -> Result<Self, CfTimeError> {
        let lowered = units.trim().to_ascii_lowercase();
        let (unit, reference) = lowered
            .split_once(" since ")
            .ok_or_else(|| CfTimeError::UnsupportedUnits(units.to_string()))?;

        let millis_per_unit = match unit.trim() {
            "milliseconds" | "millisecond" | "ms" => 1,
            "seconds" | "second" | "secs" | "sec" | "s" => 1_000,
            "minutes" | "minute" | "mins" | "min" => 60_000,
            "hours" | "hour" | "hrs" | "hr" | "h" => 3_600_000,
            "days" | "day" | "d" => 86_400_000,
            _ => return Err(CfTimeError::UnsupportedUnits(units.to_string())),
        };
        let reference = parse_reference(reference)
            .ok_or_else(|| CfTimeError::InvalidReference(units.to_string()))?;
        Ok(Self {
            millis_per_unit,
            reference,
        })
    }

    pub fn reference(&self) -> NaiveDateTime {
        self.reference
    }

    pub fn to_datetime(&self, offset: f64) -> Result<NaiveDateTime, CfTimeError> {
        let millis = offset * self.millis_per_unit as f64;
        if !millis.is_finite() || millis.abs() > i64::MAX as f64 / 2.0 {
            return Err(CfTimeError::OutOfRange(offset));
        }
        self.reference
            .checked_add_signed(Duration::milliseconds(millis.round() as i64))
            .ok_or(CfTimeError::OutOfRange(offset))
    }
}

/// Accepts `Y-M-D`, `Y-M-D h:m[:s[.f]]`, a `T` separator, and a trailing
/// `Z`/`UTC`. Components need not be zero padded.
fn parse_reference(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let raw = raw
        .strip_suffix("utc")
        .or_else(|| raw.strip_suffix('z'))
        .unwrap_or(raw)
        .trim();
    let (date_part, time_part) = match raw.split_once(|c| c == ' ' || c == 't') {
        Some((d, t)) => (d, Some(t.trim())),
        None => (raw, None),
    };

    let mut ymd = date_part.split('-').map(|p| p.parse::<i64>().ok());
    let year = i32::try_from(ymd.next()??).ok()?;
    let month = u32::try_from(ymd.next()??).ok()?;
    let day = u32::try_from(ymd.next()??).ok()?;
    if ymd.next().is_some() {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    let time = match time_part {
        None | Some("") => NaiveTime::MIN,
        Some(t) => {
            let mut hms = t.split(':');
            let h: u32 = hms.next()?.parse().ok()?;
            let m: u32 = hms.next().unwrap_or("0").parse().ok()?;
            let s: f64 = hms.next().unwrap_or("0").parse().ok()?;
            let whole = s.trunc() as u32;
            let nanos = ((s - s.trunc()) * 1e9).round() as u32;
            NaiveTime::from_hms_nano_opt(h, m, whole, nanos)?
        }
    };
    Some(date.and_time(time))
}

/// Sorted, de-duplicated timestamps of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeAxis {
    times: Vec<NaiveDateTime>,
}

impl TimeAxis {
    pub fn new(mut times: Vec<NaiveDateTime>) -> Self {
        times.sort_unstable();
        times.dedup();
        Self { times }
    }

    pub fn from_offsets(units: &CfUnits, offsets: &[f64]) -> Result<Self, CfTimeError> {
        offsets
            .iter()
            .map(|&o| units.to_datetime(o))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first(&self) -> Option<NaiveDateTime> {
        self.times.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDateTime> {
        self.times.last().copied()
    }

    pub fn as_slice(&self) -> &[NaiveDateTime] {
        &self.times
    }

    /// The available timestamp closest to `target`.
    ///
    /// Exact matches win; otherwise the closer neighbour is chosen and an
    /// exact tie goes to the later timestamp.
    pub fn nearest(
        &self,
        target: NaiveDateTime,
        tolerance: Option<Duration>,
    ) -> Result<NaiveDateTime, NearestError> {
        if self.times.is_empty() {
            return Err(NearestError::EmptyAxis);
        }
        let i = self.times.partition_point(|&x| x < target);
        let right = self.times.get(i).copied();
        let left = i.checked_sub(1).map(|j| self.times[j]);

        let nearest = match (left, right) {
            (_, Some(r)) if r == target => r,
            (Some(l), Some(r)) => {
                if target - l < r - target {
                    l
                } else {
                    r
                }
            }
            (Some(l), None) => l,
            (None, Some(r)) => r,
            (None, None) => return Err(NearestError::EmptyAxis),
        };

        if let Some(tolerance) = tolerance {
            let distance = if nearest > target {
                nearest - target
            } else {
                target - nearest
            };
            if distance > tolerance {
                return Err(NearestError::OutOfTolerance {
                    requested: target,
                    nearest,
                    tolerance,
                });
            }
        }
        Ok(nearest)
    }
}
