use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

pub const MSECS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    pub const fn from_millis(msecs: i64) -> Self {
        Timestamp(msecs)
    }

    pub const fn zero() -> Self {
        Timestamp(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn plus_millis(&self, msecs: i64) -> Self {
        Timestamp(self.0.saturating_add(msecs))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }

    /// Human-facing rendering used in messages shown to students.
    pub fn pretty(&self) -> String {
        match self.to_datetime() {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => format!("<invalid timestamp {}>", self.0),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp(value.timestamp_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
