//! Time related utilities.
//!
//! The hardware drivers absorb transient device conditions by polling with a
//! bound: either a wall-clock [`Deadline`] (disk transfers, where a drive may
//! legitimately take seconds to spin up) or a [`YieldBudget`] counted in
//! cooperative yields (identification and completion polling).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds, used for file timestamps.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A wall-clock polling bound.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// Creates a deadline expiring `secs` seconds from now.
    #[must_use]
    pub fn after_secs(secs: u64) -> Self {
        Self {
            end: Instant::now() + Duration::from_secs(secs),
        }
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// Yields the processor once, returning `false` if the deadline has
    /// passed.
    pub fn yield_once(&self) -> bool {
        if self.expired() {
            return false;
        }

        std::thread::yield_now();
        true
    }
}

/// A polling bound counted in cooperative yields rather than wall-clock
/// time.
#[derive(Clone, Copy, Debug)]
pub struct YieldBudget {
    remaining: u32,
}

impl YieldBudget {
    #[must_use]
    pub fn new(cycles: u32) -> Self {
        Self { remaining: cycles }
    }

    /// Yields the processor once, returning `false` once the budget is
    /// exhausted.
    pub fn yield_once(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }

        self.remaining -= 1;
        std::thread::yield_now();
        true
    }
}
