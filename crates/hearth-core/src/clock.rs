use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, SubsecRound, Utc};

use crate::error::{HearthError, Result};

/// Storage format for every persisted timestamp.
///
/// Second granularity, UTC, and lexicographically ordered so SQL can compare
/// the text columns directly (`available_at <= ?1`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wall-clock source. Injected into the queue so tests can move time forward.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start.trunc_subsecs(0)),
        }
    }

    /// Start at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to.trunc_subsecs(0);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Render `at` in [`TIMESTAMP_FORMAT`].
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// `at` moved `secs` seconds forward, or `None` if the result can't be stored.
///
/// `%Y` renders years past 9999 with a leading `+`, which sorts before every
/// four-digit year, so those instants are refused rather than written.
pub fn checked_later(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = Duration::try_seconds(i64::try_from(secs).ok()?)?;
    at.checked_add_signed(delta).filter(|t| t.year() <= 9999)
}

/// `at` moved `secs` seconds back, or `None` before year 1.
pub fn checked_earlier(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = Duration::try_seconds(i64::try_from(secs).ok()?)?;
    at.checked_sub_signed(delta).filter(|t| t.year() >= 1)
}

/// Parse a stored timestamp back into UTC.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| HearthError::InvalidTimestamp(format!("{s}: {e}")))
}
