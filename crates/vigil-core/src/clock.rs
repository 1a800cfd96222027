//! Paired wall-clock / monotonic timestamps.
//!
//! Elapsed-time decisions (debounce, inactivity) use the monotonic half;
//! persisted session bounds use the wall-clock half.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A moment observed on both the wall clock and the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub wall: DateTime<Utc>,
    pub mono: Instant,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    /// Monotonic time elapsed since `earlier`, zero if `earlier` is later.
    pub fn since(&self, earlier: &Timestamp) -> Duration {
        self.mono.saturating_duration_since(earlier.mono)
    }

    /// Shift both halves forward by `by`.
    pub fn advanced(&self, by: Duration) -> Self {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        Self {
            wall: self.wall + chrono::Duration::milliseconds(millis),
            mono: self.mono + by,
        }
    }
}

/// Source of timestamps, injectable so time-dependent behaviour is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The real system clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Timestamp,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Timestamp::now())
    }

    pub fn starting_at(base: Timestamp) -> Self {
        Self {
            base,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base.advanced(offset)
    }
}
