//! Backoff calculation with jitter
//!
//! Pure delay math used by the retry executor. The random jitter sample is
//! drawn separately ([`sample_jitter`]) so [`ExponentialBackoff::delay`] stays
//! deterministic and testable.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Fraction of the delay that jitter may add or subtract (0.0 to 1.0)
    pub jitter_ratio: f64,
}

impl ExponentialBackoff {
    /// Delay before retry number `retry` (1-based) without jitter
    ///
    /// `min(max_delay, initial_delay * multiplier^(retry - 1))`
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry number `retry` with jitter applied
    ///
    /// `sample` must lie in `[-1.0, 1.0]`; the delay moves by at most
    /// `jitter_ratio` of itself in either direction and never exceeds
    /// `max_delay`.
    pub fn delay(&self, retry: u32, sample: f64) -> Duration {
        let base = self.base_delay(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return base;
        }
        let factor = 1.0 + ratio * sample.clamp(-1.0, 1.0);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .map_or(base, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry number `retry` with a freshly drawn jitter sample
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        self.delay(retry, sample_jitter())
    }
}

/// Draw a uniform jitter sample in `[-1.0, 1.0]`
pub fn sample_jitter() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}
