//! Bridges the job store's absolute wall-clock nanosecond timestamps
//! (chosen so they survive a restart and round-trip through the WAL) to
//! the runtime's monotonic [`tokio::time::Instant`], which is what
//! actually drives sleeping.
//!
//! A `Clock` is constructed once at startup, recording the current
//! instant and epoch time as a fixed reference pair; every later
//! conversion is just arithmetic against that pair, so the store itself
//! never has to touch the system clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// While a connection is blocked in `reserve`, its eventual `DEADLINE_SOON`
/// warning must have a chance to be observed before the job's TTR
/// actually expires.
pub const SAFETY_MARGIN_NS: i64 = 1_000_000_000;

#[derive(Clone, Copy, Debug)]
pub struct Clock {
    base_instant: Instant,
    base_epoch_ns: i64,
}

impl Clock {
    pub fn new() -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Clock { base_instant: Instant::now(), base_epoch_ns: now.as_nanos() as i64 }
    }

    pub fn now_ns(&self) -> i64 {
        self.base_epoch_ns + self.base_instant.elapsed().as_nanos() as i64
    }

    /// Converts an absolute epoch-ns deadline to a monotonic `Instant` the
    /// runtime can actually sleep until. Deadlines already in the past
    /// resolve to `now`.
    pub fn to_instant(&self, deadline_ns: i64) -> Instant {
        let delta_ns = deadline_ns - self.base_epoch_ns;
        if delta_ns <= 0 {
            return Instant::now();
        }
        self.base_instant + Duration::from_nanos(delta_ns as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_is_monotonically_nondecreasing() {
        let clock = Clock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn past_deadline_resolves_immediately() {
        let clock = Clock::new();
        let past = clock.now_ns() - 1_000_000_000;
        assert!(clock.to_instant(past) <= Instant::now());
    }
}
