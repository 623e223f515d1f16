//! Retry backoff policy

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `initial * multiplier^(retried - 1)`, capped at `max`.
///
/// With jitter enabled the delay is scaled into `[0.8, 1.0]` of that value.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    multiplier: u32,
    max: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), 2, Duration::from_secs(3600))
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, multiplier: u32, max: Duration) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1),
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt number `retried` (1-based)
    pub fn delay(&self, retried: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(retried);
        if self.jitter {
            base.mul_f64(rng.gen_range(0.8..=1.0))
        } else {
            base
        }
    }

    fn base_delay(&self, retried: u32) -> Duration {
        let exponent = retried.saturating_sub(1);
        self.multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}
