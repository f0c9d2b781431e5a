//! Calendar-aligned time windows and bucket resolution.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Time window for a resource budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// One-minute buckets
    Minute,
    /// One-hour buckets
    Hour,
    /// Calendar day buckets (UTC)
    Day,
    /// Calendar month buckets (UTC) with a fixed 30-day duration
    Month,
}

impl TimeWindow {
    /// Get the duration of this time window.
    ///
    /// `Month` is always 30 days even though its bucket key follows the
    /// calendar month, so `bucket_start + duration` can land before or after
    /// the first of the next month.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86_400),
            TimeWindow::Month => Duration::from_secs(30 * 86_400),
        }
    }

    /// Key identifying the calendar slot containing `now`.
    pub fn bucket_key(&self, now: DateTime<Utc>) -> String {
        let format = match self {
            TimeWindow::Minute => "%Y-%m-%dT%H:%M",
            TimeWindow::Hour => "%Y-%m-%dT%H",
            TimeWindow::Day => "%Y-%m-%d",
            TimeWindow::Month => "%Y-%m",
        };
        now.format(format).to_string()
    }

    /// The instant the slot containing `now` began.
    pub fn bucket_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeWindow::Minute => floor_to(now, 60),
            TimeWindow::Hour => floor_to(now, 3600),
            TimeWindow::Day => floor_to(now, 86_400),
            TimeWindow::Month => floor_to(now, 86_400) - TimeDelta::days(i64::from(now.day0())),
        }
    }

    /// Resolve the active bucket for `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Window {
        Window {
            duration: self.duration(),
            bucket_key: self.bucket_key(now),
            bucket_start: self.bucket_start(now),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
            TimeWindow::Month => "month",
        };
        f.write_str(name)
    }
}

/// Truncate to a multiple of `slot_secs` since the Unix epoch.
fn floor_to(now: DateTime<Utc>, slot_secs: i64) -> DateTime<Utc> {
    let into_slot = now.timestamp().rem_euclid(slot_secs);
    now - TimeDelta::seconds(into_slot)
        - TimeDelta::nanoseconds(i64::from(now.timestamp_subsec_nanos()))
}

/// A resolved time bucket.
///
/// Derived from the clock on every check; stores only keep `bucket_key`
/// (and the duration, for expiry) next to each counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Length of the bucket
    pub duration: Duration,
    /// Identity of the calendar slot
    pub bucket_key: String,
    /// When the slot began
    pub bucket_start: DateTime<Utc>,
}

impl Window {
    /// The instant the counter for this bucket resets.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.bucket_start + TimeDelta::seconds(self.duration.as_secs() as i64)
    }

    /// Time remaining until `reset_at`, or zero if it has passed.
    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at() - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Window duration in whole seconds.
    pub fn duration_secs(&self) -> i64 {
        self.duration.as_secs() as i64
    }
}
