//! Monotonic timestamp oracle.
//!
//! Timestamps are wall-clock nanoseconds since the UNIX epoch, bumped
//! to `previous + 1` whenever the clock stalls or steps backwards, so
//! two writes never share a timestamp within one store instance. The
//! counter sits behind its own lock to keep timestamp contention away
//! from the store lock.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::record::Timestamp;

/// Current wall clock in nanoseconds since the UNIX epoch.
pub fn wall_clock_ns() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Hands out strictly increasing timestamps.
pub struct TimestampOracle {
    last: Mutex<Timestamp>,
}

impl TimestampOracle {
    /// Starts the oracle at zero; recovery calls [`observe`](Self::observe)
    /// to advance it past everything already on disk.
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    /// Ensures future timestamps exceed `ts`.
    pub fn observe(&self, ts: Timestamp) {
        let mut last = lock(&self.last);
        if ts > *last {
            *last = ts;
        }
    }

    /// Next timestamp: the wall clock, or `previous + 1` on collision.
    pub fn next(&self) -> Timestamp {
        let now = wall_clock_ns();
        let mut last = lock(&self.last);
        let ts = if now <= *last { *last + 1 } else { now };
        *last = ts;
        ts
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(m: &Mutex<Timestamp>) -> std::sync::MutexGuard<'_, Timestamp> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
