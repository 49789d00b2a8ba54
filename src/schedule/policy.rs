//! Refresh intervals and the pure scheduling math built on them.
//!
//! Nothing in here performs I/O. Every function takes `now` explicitly so the
//! scheduler, the stores and the tests all agree on a single notion of time.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::state::ScheduleState;

/// Default cap on the error backoff multiplier.
pub const DEFAULT_BACKOFF_CAP: u32 = 16;

/// Unit of a [`RefreshInterval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl TimeUnit {
    /// All units, largest first.
    const DESCENDING: [TimeUnit; 5] = [
        TimeUnit::Weeks,
        TimeUnit::Days,
        TimeUnit::Hours,
        TimeUnit::Minutes,
        TimeUnit::Seconds,
    ];

    /// Number of seconds in one unit.
    pub fn seconds(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 60 * 60,
            TimeUnit::Days => 24 * 60 * 60,
            TimeUnit::Weeks => 7 * 24 * 60 * 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" | "s" => Ok(TimeUnit::Seconds),
            "minutes" | "minute" | "m" => Ok(TimeUnit::Minutes),
            "hours" | "hour" | "h" => Ok(TimeUnit::Hours),
            "days" | "day" | "d" => Ok(TimeUnit::Days),
            "weeks" | "week" | "w" => Ok(TimeUnit::Weeks),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}

/// How often a feed is refreshed.
///
/// An `amount` of zero or less disables automatic refresh entirely: the feed
/// is never selected as due, though it can still be refreshed manually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefreshInterval {
    pub amount: i32,
    pub unit: TimeUnit,
}

impl RefreshInterval {
    pub const fn new(amount: i32, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    /// A disabled interval (manual refresh only).
    pub const fn disabled() -> Self {
        Self::new(0, TimeUnit::Minutes)
    }

    /// Canonical interval length in seconds. Zero or negative when disabled.
    pub fn seconds(&self) -> i64 {
        i64::from(self.amount) * self.unit.seconds()
    }

    pub fn is_enabled(&self) -> bool {
        self.seconds() > 0
    }

    /// Picks the largest unit that divides `seconds` evenly.
    ///
    /// Non-positive input yields [`RefreshInterval::disabled`]. Values too
    /// large for an `i32` amount saturate.
    pub fn from_seconds(seconds: i64) -> Self {
        if seconds <= 0 {
            return Self::disabled();
        }
        let unit = TimeUnit::DESCENDING
            .into_iter()
            .find(|u| seconds % u.seconds() == 0)
            .unwrap_or(TimeUnit::Seconds);
        let amount = i32::try_from(seconds / unit.seconds()).unwrap_or(i32::MAX);
        Self::new(amount, unit)
    }
}

impl Default for RefreshInterval {
    fn default() -> Self {
        Self::new(30, TimeUnit::Minutes)
    }
}

impl fmt::Display for RefreshInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_enabled() {
            write!(f, "{} {}", self.amount, self.unit)
        } else {
            f.write_str("disabled")
        }
    }
}

/// Computes due times and error backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Upper bound of the backoff multiplier applied to the interval.
    pub backoff_cap: u32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl RefreshPolicy {
    pub fn new(backoff_cap: u32) -> Self {
        Self {
            backoff_cap: backoff_cap.max(1),
        }
    }

    /// True iff refresh is enabled and `now` has reached the scheduled time.
    ///
    /// A feed that was never scheduled is due immediately.
    pub fn is_due(&self, interval: RefreshInterval, state: &ScheduleState, now: DateTime<Utc>) -> bool {
        interval.is_enabled() && state.next_scheduled.map_or(true, |next| now >= next)
    }

    /// `now + interval`, or `None` when refresh is disabled.
    pub fn next_after_success(
        &self,
        interval: RefreshInterval,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        interval
            .is_enabled()
            .then(|| offset(now, interval.seconds()))
    }

    /// `now + interval * min(2^consecutive_errors, cap)`, or `None` when disabled.
    ///
    /// `consecutive_errors` is the count including the failure being recorded.
    pub fn next_after_error(
        &self,
        interval: RefreshInterval,
        consecutive_errors: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !interval.is_enabled() {
            return None;
        }
        let multiplier = self.backoff_multiplier(consecutive_errors);
        Some(offset(now, interval.seconds().saturating_mul(multiplier)))
    }

    /// Backoff multiplier for the given error count, capped at `backoff_cap`.
    pub fn backoff_multiplier(&self, consecutive_errors: u32) -> i64 {
        let cap = i64::from(self.backoff_cap.max(1));
        1i64.checked_shl(consecutive_errors)
            .filter(|m| *m > 0)
            .map_or(cap, |m| m.min(cap))
    }
}

fn offset(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
