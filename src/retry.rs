//! Retry-policy contract: given an attempt count and the error that just
//! failed, decide whether to retry and how long to wait first. No direct
//! teacher counterpart (the teacher reconnects unconditionally); grounded
//! on the contract-only shape the specification calls for.

use std::time::Duration;

use rand::Rng;

use crate::error::SdkError;

/// Multiplies a computed delay by a uniform factor in this range when
/// jitter is enabled, so that many devices retrying after the same
/// outage don't all reconnect in lockstep.
const JITTER_RANGE: std::ops::Range<f64> = 0.95..1.05;

pub trait RetryPolicy: Send + Sync {
    /// `attempt` is 1 for the first retry. Returns `None` if no further
    /// retry should be attempted (cap reached, or `last_error` is not
    /// transient).
    fn should_retry(&self, attempt: u32, last_error: &SdkError) -> Option<Duration>;
}

fn apply_jitter(delay: Duration, use_jitter: bool) -> Duration {
    if !use_jitter {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(JITTER_RANGE);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

fn within_cap(attempt: u32, max_retries: u32) -> bool {
    max_retries == 0 || attempt <= max_retries
}

/// Retries after the same fixed delay every time.
pub struct FixedDelay {
    pub delay: Duration,
    pub max_retries: u32,
    pub use_jitter: bool,
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, attempt: u32, last_error: &SdkError) -> Option<Duration> {
        if !last_error.is_transient() || !within_cap(attempt, self.max_retries) {
            return None;
        }
        Some(apply_jitter(self.delay, self.use_jitter))
    }
}

/// Delay grows by a fixed step each attempt: `base + step * (attempt - 1)`.
pub struct Incremental {
    pub base: Duration,
    pub step: Duration,
    pub max_retries: u32,
    pub use_jitter: bool,
}

impl RetryPolicy for Incremental {
    fn should_retry(&self, attempt: u32, last_error: &SdkError) -> Option<Duration> {
        if !last_error.is_transient() || !within_cap(attempt, self.max_retries) {
            return None;
        }
        let delay = self.base + self.step * (attempt.saturating_sub(1));
        Some(apply_jitter(delay, self.use_jitter))
    }
}

/// Delay doubles each attempt, capped at `max_delay`:
/// `min(base * 2^(attempt - 1), max_delay)`.
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub use_jitter: bool,
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, last_error: &SdkError) -> Option<Duration> {
        if !last_error.is_transient() || !within_cap(attempt, self.max_retries) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self.base.as_secs_f64() * 2f64.powi(exponent as i32);
        let delay = Duration::from_secs_f64(scaled).min(self.max_delay);
        Some(apply_jitter(delay, self.use_jitter))
    }
}
