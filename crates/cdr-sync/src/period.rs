//! Reporting periods
//!
//! A [`Period`] identifies one quarterly release. The publisher lists periods
//! as `m/d/yyyy` quarter-end dates; locally they are keyed by a filesystem-safe
//! slug (`mm-dd-yyyy`). Operators and tests may also write `2024Q1` or
//! `2024-03-31`. Whatever the spelling, periods order by their quarter-end
//! date, so processing is chronological regardless of listing order.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid period '{0}': expected m/d/yyyy, mm-dd-yyyy, yyyy-mm-dd or yyyyQn")]
pub struct PeriodParseError(pub String);

/// One reporting quarter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    id: String,
    date: NaiveDate,
}

impl Period {
    pub fn parse(raw: &str) -> Result<Self, PeriodParseError> {
        let trimmed = raw.trim();
        let err = || PeriodParseError(raw.to_string());

        if let Some(period) = Self::parse_quarter(trimmed) {
            return Ok(period);
        }

        let date = if trimmed.contains('/') {
            NaiveDate::parse_from_str(trimmed, "%m/%d/%Y").map_err(|_| err())?
        } else if trimmed.len() >= 5 && trimmed.as_bytes()[4] == b'-' {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| err())?
        } else {
            NaiveDate::parse_from_str(trimmed, "%m-%d-%Y").map_err(|_| err())?
        };

        Ok(Self::from_date(date))
    }

    /// Period keyed by its quarter-end date
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            id: date.format("%m-%d-%Y").to_string(),
            date,
        }
    }

    /// `2024Q1`, `2024q1` or `2024-Q1`
    fn parse_quarter(raw: &str) -> Option<Self> {
        let upper = raw.to_ascii_uppercase();
        let (year, quarter) = upper.split_once('Q')?;
        let year: i32 = year.trim_end_matches('-').parse().ok()?;
        let quarter: u32 = quarter.parse().ok()?;

        let date = match quarter {
            1 => NaiveDate::from_ymd_opt(year, 3, 31),
            2 => NaiveDate::from_ymd_opt(year, 6, 30),
            3 => NaiveDate::from_ymd_opt(year, 9, 30),
            4 => NaiveDate::from_ymd_opt(year, 12, 31),
            _ => None,
        }?;

        Some(Self {
            id: format!("{}Q{}", year, quarter),
            date,
        })
    }

    /// Stable identifier used for state keys, directory names and remote markers
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// The spelling the publisher's listing uses, e.g. `3/31/2024`
    pub fn listing_label(&self) -> String {
        format!("{}/{}/{}", self.date.month(), self.date.day(), self.date.year())
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.id
    }
}
