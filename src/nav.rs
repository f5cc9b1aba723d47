//! Network Allocation Vector (virtual carrier sense).

use embassy_time::{Duration, Instant};

/// Duration/ID values above this (in µs) are not NAV durations and are ignored.
pub const MAX_NAV_DURATION_US: u64 = 32767;

/// Busy-until record kept as (last start, last duration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nav {
    last_start: Instant,
    last_duration: Duration,
}

impl Default for Nav {
    fn default() -> Self {
        Self {
            last_start: Instant::from_ticks(0),
            last_duration: Duration::from_ticks(0),
        }
    }
}

impl Nav {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the reservation to `now + duration` if that ends later than the
    /// current one. Returns whether the NAV was updated.
    pub fn start(&mut self, now: Instant, duration: Duration) -> bool {
        let new_end = now + duration;
        if new_end > self.busy_until() {
            self.last_start = now;
            self.last_duration = duration;
            return true;
        }
        false
    }

    /// Overwrite the reservation unconditionally.
    pub fn reset(&mut self, now: Instant, duration: Duration) {
        self.last_start = now;
        self.last_duration = duration;
    }

    /// True once the reservation has strictly passed.
    pub fn is_zero(&self, now: Instant) -> bool {
        self.busy_until() < now
    }

    pub fn busy_until(&self) -> Instant {
        self.last_start + self.last_duration
    }

    pub fn last_start(&self) -> Instant {
        self.last_start
    }

    pub fn last_duration(&self) -> Duration {
        self.last_duration
    }
}
