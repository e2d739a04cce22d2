//! Retry pacing for ledger flushes.
//!
//! Attempt semantics follow the usual convention: attempt `0` is the initial
//! call and carries no delay; retries start at attempt `1`. Delays double per
//! attempt, saturate at the cap, and can be spread with full jitter (uniform
//! in `[0, delay]`) to keep retrying instances from synchronizing.

use std::time::Duration;

use rand::{rng, Rng};

/// Exponential backoff with a cap and optional full jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    /// Delays of `base * 2^(attempt-1)`, capped at `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self { base, max, jitter: false }
    }

    /// Randomize each delay uniformly over `[0, delay]`.
    pub fn with_full_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before the given attempt (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let raw = self.base.saturating_mul(2u32.saturating_pow(exponent));
        let capped = raw.min(self.max);
        if self.jitter && !capped.is_zero() {
            let millis = capped.as_millis().min(u64::MAX as u128) as u64;
            Duration::from_millis(rng().random_range(0..=millis))
        } else {
            capped
        }
    }
}
