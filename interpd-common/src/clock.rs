//! Clock abstraction and timestamp arithmetic
//!
//! All threshold and deadline math in the engine goes through a `Clock` so
//! tests can pin "now" and step it forward deterministically. All times are
//! UTC; no local-time parsing path exists anywhere in the engine.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock (production).
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Whole days until `start`, floor division on whole seconds.
///
/// Negative when `start` is in the past: a booking 1 second overdue yields
/// -1, never 0, so "already due" checks stay strict.
pub fn days_until(now: DateTime<Utc>, start: DateTime<Utc>) -> i64 {
    let secs = (start - now).num_seconds();
    secs.div_euclid(86_400)
}

/// Fractional hours between two instants (may be negative).
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Duration of a half-open interval in fractional hours, zero-floored.
pub fn duration_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    hours_between(start, end).max(0.0)
}
