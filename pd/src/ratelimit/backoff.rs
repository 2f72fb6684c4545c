//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Retry delay policy: `base * 2^retry_count`, capped at `max`, with
/// symmetric jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, 0.0..=1.0
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before attempt number `retry_count + 1`, without jitter
    ///
    /// `retry_count` is the count before the failure being handled, so the
    /// first retry waits `base`.
    pub fn delay_without_jitter(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay with jitter applied, never above `max`
    pub fn delay(&self, retry_count: u32) -> Duration {
        let raw = self.delay_without_jitter(retry_count);
        if self.jitter <= 0.0 || raw.is_zero() {
            return raw;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        let jittered = raw.as_secs_f64() * (1.0 + spread);
        let delay = Duration::from_secs_f64(jittered.max(0.0)).min(self.max);
        debug!(retry_count, ?raw, ?delay, "BackoffPolicy::delay");
        delay
    }

    /// Delay in whole milliseconds, for timestamp arithmetic
    pub fn delay_ms(&self, retry_count: u32) -> i64 {
        i64::try_from(self.delay(retry_count).as_millis()).unwrap_or(i64::MAX)
    }
}
