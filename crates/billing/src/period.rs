//! Reset-period arithmetic
//!
//! Converts `(count, unit)` period descriptors into minutes, days, and
//! durations. Calendar-naive: a month is 30 days and a year 365. Good enough
//! for rolling usage windows; not leap-aware.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::BillingError;

/// Period unit for plan and feature reset windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    /// Minutes in one unit
    fn unit_minutes(&self) -> i64 {
        match self {
            Period::Minute => 1,
            Period::Hour => 60,
            Period::Day => 60 * 24,
            Period::Week => 60 * 24 * 7,
            Period::Month => 60 * 24 * 30,
            Period::Year => 60 * 24 * 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Minute => "minute",
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
        }
    }
}

impl FromStr for Period {
    type Err = BillingError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "minute" => Ok(Period::Minute),
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "year" => Ok(Period::Year),
            _ => Err(BillingError::InvalidPeriodUnit(raw.to_string())),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A `(count, unit)` reset window, e.g. (1, Month) or (12, Hour)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPeriod {
    pub count: i32,
    pub unit: Period,
}

impl ResetPeriod {
    pub fn new(count: i32, unit: Period) -> Self {
        Self { count, unit }
    }

    /// Build from the nullable column pair; both must be present.
    pub fn from_columns(count: Option<i32>, unit: Option<Period>) -> Option<Self> {
        match (count, unit) {
            (Some(count), Some(unit)) => Some(Self { count, unit }),
            _ => None,
        }
    }

    pub fn minutes(&self) -> i64 {
        i64::from(self.count) * self.unit.unit_minutes()
    }

    pub fn days(&self) -> f64 {
        self.minutes() as f64 / (60.0 * 24.0)
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }
}

impl std::fmt::Display for ResetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}(s)", self.count, self.unit)
    }
}

/// End of a subscription window starting at `start_at`, or None when the
/// plan version carries no reset period (unbounded subscription).
pub fn plan_end_at(reset: Option<ResetPeriod>, start_at: OffsetDateTime) -> Option<OffsetDateTime> {
    reset.map(|period| start_at + period.duration())
}
