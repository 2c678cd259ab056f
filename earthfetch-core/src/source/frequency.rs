//! Sampling frequency of a data source (`8D`, `1M`, `1Y`).

use chrono::{Duration, Months, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrequencyError {
    #[error("frequency '{0}' must be a positive integer followed by D, M or Y")]
    Malformed(String),
    #[error("frequency '{0}' must be at least one day")]
    TooShort(String),
}

/// Calendar unit of a [`Frequency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrequencyUnit {
    Day,
    Month,
    Year,
}

impl FrequencyUnit {
    fn code(self) -> char {
        match self {
            FrequencyUnit::Day => 'D',
            FrequencyUnit::Month => 'M',
            FrequencyUnit::Year => 'Y',
        }
    }
}

/// A step of `count` calendar units. Always at least one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frequency {
    count: u32,
    unit: FrequencyUnit,
}

impl Frequency {
    pub fn new(count: u32, unit: FrequencyUnit) -> Option<Self> {
        (count > 0).then_some(Self { count, unit })
    }

    pub fn daily() -> Self {
        Self {
            count: 1,
            unit: FrequencyUnit::Day,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn unit(&self) -> FrequencyUnit {
        self.unit
    }

    pub fn is_daily(&self) -> bool {
        *self == Self::daily()
    }

    /// `start` advanced by `k` steps. `None` on calendar overflow.
    pub fn nth_after(&self, start: NaiveDateTime, k: u32) -> Option<NaiveDateTime> {
        let steps = self.count.checked_mul(k)?;
        match self.unit {
            FrequencyUnit::Day => start.checked_add_signed(Duration::days(i64::from(steps))),
            FrequencyUnit::Month => start.checked_add_months(Months::new(steps)),
            FrequencyUnit::Year => start.checked_add_months(Months::new(steps.checked_mul(12)?)),
        }
    }

    /// Span of one step measured from `start`.
    pub fn span_from(&self, start: NaiveDateTime) -> Option<Duration> {
        self.nth_after(start, 1).map(|t| t - start)
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Self::daily()
    }
}

impl FromStr for Frequency {
    type Err = FrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let malformed = || FrequencyError::Malformed(s.to_string());

        let unit_char = trimmed.chars().last().ok_or_else(malformed)?;
        let unit = match unit_char.to_ascii_uppercase() {
            'D' => FrequencyUnit::Day,
            'M' => FrequencyUnit::Month,
            'Y' => FrequencyUnit::Year,
            _ => return Err(malformed()),
        };
        let digits = &trimmed[..trimmed.len() - unit_char.len_utf8()];
        // "D" alone means one unit, like pandas offsets
        let count = if digits.is_empty() {
            1
        } else {
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(malformed());
            }
            digits.parse::<u32>().map_err(|_| malformed())?
        };
        Frequency::new(count, unit).ok_or_else(|| FrequencyError::TooShort(s.to_string()))
    }
}

impl TryFrom<String> for Frequency {
    type Error = FrequencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Frequency> for String {
    fn from(value: Frequency) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.code())
    }
}
