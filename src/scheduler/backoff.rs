//! Exponential backoff with multiplicative jitter.

use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, multiplier: f64, jitter_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
            config.jitter_factor,
        )
    }

    /// Same policy without jitter
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// `min(max, base * multiplier^(attempt - 1))`, non-decreasing in `attempt`
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        self.scaled(self.base, factor)
    }

    /// Jittered delay for `attempt`, never above the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_factor > 0.0 {
            let jitter = fastrand::f64() * self.jitter_factor;
            self.scaled(delay, 1.0 + jitter)
        } else {
            delay
        }
    }

    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let secs = delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
