//! Period arithmetic for panel timestamps.
//!
//! Calendar panels step by a [`Frequency`]; integer-coded panels always step
//! by one.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::types::Timestamp;
use crate::error::CvError;

/// Regular spacing between consecutive observations of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Frequency {
    /// Integer periods, stepping by `n`.
    Step(i64),
    Hours(i64),
    Days(i64),
    Weeks(i64),
    Months(u32),
    Quarters(u32),
    Years(u32),
}

impl Frequency {
    /// Unit step used for integer-coded time columns.
    pub const UNIT: Frequency = Frequency::Step(1);

    /// Shift `ts` by `periods` steps of this frequency (negative goes back).
    pub fn shift(&self, ts: Timestamp, periods: i64) -> Result<Timestamp, CvError> {
        match (self, ts) {
            (Frequency::Step(n), Timestamp::Int(t)) => Ok(Timestamp::Int(t + n * periods)),
            (Frequency::Step(_), Timestamp::DateTime(_)) => Err(CvError::config(
                "integer step frequency cannot shift a calendar timestamp",
            )),
            (_, Timestamp::Int(t)) => Ok(Timestamp::Int(t + periods)),
            (freq, Timestamp::DateTime(dt)) => shift_datetime(*freq, dt, periods)
                .map(Timestamp::DateTime)
                .ok_or_else(|| CvError::config(format!("timestamp {} out of range after shifting {} {}", dt, periods, freq))),
        }
    }
}

fn shift_datetime(freq: Frequency, dt: NaiveDateTime, periods: i64) -> Option<NaiveDateTime> {
    match freq {
        Frequency::Hours(n) => dt.checked_add_signed(Duration::hours(n * periods)),
        Frequency::Days(n) => dt.checked_add_signed(Duration::days(n * periods)),
        Frequency::Weeks(n) => dt.checked_add_signed(Duration::weeks(n * periods)),
        Frequency::Months(n) => add_months(dt, n as i64 * periods),
        Frequency::Quarters(n) => add_months(dt, 3 * n as i64 * periods),
        Frequency::Years(n) => add_months(dt, 12 * n as i64 * periods),
        Frequency::Step(_) => None,
    }
}

/// Add (or subtract) months. A month-end timestamp lands on the end of the
/// target month; any other day is clamped to the target month's length.
fn add_months(dt: NaiveDateTime, months: i64) -> Option<NaiveDateTime> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    let shifted = if months >= 0 {
        dt.checked_add_months(magnitude)?
    } else {
        dt.checked_sub_months(magnitude)?
    };
    if is_month_end(dt.date()) {
        Some(month_end(shifted.date())?.and_time(dt.time()))
    } else {
        Some(shifted)
    }
}

fn is_month_end(date: NaiveDate) -> bool {
    date.succ_opt().map_or(true, |next| next.month() != date.month())
}

fn month_end(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)?.checked_add_months(Months::new(1))?.pred_opt()
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Step(n) => write!(f, "{}", n),
            Frequency::Hours(n) => write!(f, "{}h", n),
            Frequency::Days(n) => write!(f, "{}D", n),
            Frequency::Weeks(n) => write!(f, "{}W", n),
            Frequency::Months(n) => write!(f, "{}M", n),
            Frequency::Quarters(n) => write!(f, "{}Q", n),
            Frequency::Years(n) => write!(f, "{}Y", n),
        }
    }
}

impl FromStr for Frequency {
    type Err = CvError;

    /// Parse an alias such as `D`, `7D`, `W`, `M`, `MS`, `Q`, `Y`, `h` or a
    /// bare integer step.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(step) = s.parse::<i64>() {
            if step <= 0 {
                return Err(CvError::config(format!("frequency step must be positive, got {}", step)));
            }
            return Ok(Frequency::Step(step));
        }

        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (count, alias) = s.split_at(split);
        let count: i64 = if count.is_empty() {
            1
        } else {
            count
                .parse()
                .map_err(|_| CvError::config(format!("invalid frequency multiplier in '{}'", s)))?
        };
        if count <= 0 {
            return Err(CvError::config(format!("frequency multiplier must be positive in '{}'", s)));
        }
        let months = u32::try_from(count).map_err(|_| CvError::config(format!("frequency '{}' too large", s)))?;

        match alias {
            "h" | "H" => Ok(Frequency::Hours(count)),
            "D" | "d" => Ok(Frequency::Days(count)),
            "W" | "w" => Ok(Frequency::Weeks(count)),
            "M" | "MS" | "ME" => Ok(Frequency::Months(months)),
            "Q" | "QS" | "QE" => Ok(Frequency::Quarters(months)),
            "Y" | "YS" | "YE" | "A" => Ok(Frequency::Years(months)),
            _ => Err(CvError::config(format!("unknown frequency alias '{}'", s))),
        }
    }
}

impl TryFrom<String> for Frequency {
    type Error = CvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Frequency> for String {
    fn from(freq: Frequency) -> Self {
        freq.to_string()
    }
}
