//! Retry delays for undeliverable messages.
//!
//! The delay for the n-th retry is `base * 2^n` plus random jitter, capped at
//! `max`. Jitter never exceeds the un-jittered delay, so successive delays of
//! one message never shrink.

use std::time::Duration;

use rand::Rng;

use crate::config::RouterSettings;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoff {
    /// The delay before the first retry.
    delay_initial: Duration,
    /// Cap for a single delay.
    delay_max: Duration,
    /// Jitter as a fraction of the un-jittered delay, within `[0, 1]`.
    jitter_ratio: f64,
}

impl RetryBackoff {
    #[must_use]
    pub fn new(delay_initial: Duration, delay_max: Duration, jitter_ratio: f64) -> Self {
        Self {
            delay_initial,
            delay_max: delay_max.max(delay_initial),
            jitter_ratio: if jitter_ratio.is_finite() {
                jitter_ratio.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    #[must_use]
    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.retry_interval_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.jitter_ratio,
        )
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay(retry_count);
        let max_jitter = (base.as_millis() as f64 * self.jitter_ratio) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        (base + Duration::from_millis(jitter)).min(self.delay_max)
    }

    /// Un-jittered delay for `retry_count`, already capped.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let initial_ms = self.delay_initial.as_millis() as u64;
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor)).min(self.delay_max)
    }

    pub fn delay_initial(&self) -> Duration {
        self.delay_initial
    }

    pub fn delay_max(&self) -> Duration {
        self.delay_max
    }
}
