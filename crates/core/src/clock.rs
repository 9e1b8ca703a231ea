//! Time source shared by every broker component.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// A source of timestamps for deadlines, backoff windows and retention.
///
/// All broker decisions read time through this trait so tests can drive the
/// engine with [`ManualClock`] instead of sleeping.
pub trait Clock: Send + Sync + 'static {
    /// Current time. Successive calls never go backwards.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock anchored, monotonic clock.
///
/// Captures `Utc::now()` once at construction and advances it with
/// `std::time::Instant`, so NTP adjustments cannot move deadlines backwards.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start_wall: DateTime<Utc>,
    start_instant: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start_wall: Utc::now(),
            start_instant: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        deadline_after(self.start_wall, self.start_instant.elapsed())
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = deadline_after(*now, by);
    }

    /// Jump to `at`. Ignored if `at` is in the past.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if at > *now {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `at + duration`, saturating at the largest representable instant.
pub fn deadline_after(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time elapsed from `earlier` to `later`; zero if `later` precedes `earlier`.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
