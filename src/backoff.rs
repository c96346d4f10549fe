//! Delay before the n-th reconnection attempt.

use std::time::Duration;

use rand::Rng;

pub trait BackoffStrategy: Send + Sync {
    /// Delay before attempt `attempt` (0-based).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Truncated binary exponential backoff: attempt `a` waits a uniformly random
/// whole number of seconds in `[0, (2^(e + 1) - 1) * slot_time)` with
/// `e = min(a, ceiling - 1)`, so `ceiling` distinct windows exist before the
/// window stops growing.
///
/// With the defaults (60s slot, ceiling 5) the windows are 1, 3, 7, 15 and
/// 31 minutes; attempt 4 and every later attempt wait under 31 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncatedBinaryExponentialBackoff {
    pub slot_time: Duration,
    pub ceiling: u32,
}

impl Default for TruncatedBinaryExponentialBackoff {
    fn default() -> Self {
        Self {
            slot_time: Duration::from_secs(60),
            ceiling: 5,
        }
    }
}

impl TruncatedBinaryExponentialBackoff {
    pub fn new(slot_time: Duration, ceiling: u32) -> Self {
        Self { slot_time, ceiling }
    }

    /// Exclusive upper bound of the delay window for `attempt`, in seconds.
    pub fn window_secs(&self, attempt: u32) -> u64 {
        // Cap the exponent so the shift cannot overflow
        let exponent = attempt.min(self.ceiling.saturating_sub(1)).min(62) + 1;
        ((1u64 << exponent) - 1).saturating_mul(self.slot_time.as_secs())
    }

    /// Same as [`next_delay`](BackoffStrategy::next_delay) with an explicit
    /// randomness source.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let window = self.window_secs(attempt);
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(rng.random_range(0..window))
    }
}

impl BackoffStrategy for TruncatedBinaryExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::rng())
    }
}

/// Always the same delay. Handy for tests and for embedders with their own
/// retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl BackoffStrategy for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}
