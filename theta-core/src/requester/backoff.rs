//! Jittered exponential backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with exponential backoff and proportional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Three attempts, 2s doubling up to 6s.
    pub fn default_terminal() -> Self {
        Self::new(3, 2_000, 6_000, 0.2)
    }

    /// Retries back to back. Useful against in-memory transports.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0, 0, 0.0)
    }

    /// Same cap and jitter with a different attempt budget and base delay.
    pub fn with_limits(&self, max_attempts: u32, base_delay: Duration) -> Self {
        let base_delay_ms = base_delay.as_millis().min(u64::MAX as u128) as u64;
        Self::new(
            max_attempts,
            base_delay_ms,
            self.max_delay_ms.max(base_delay_ms),
            self.jitter_pct,
        )
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay before retry `retry` (1 for the second attempt) given a jitter
    /// sample in `[-1, 1]`.
    ///
    /// `base · 2^(retry-1)`, capped at `max_delay_ms`, shifted by up to
    /// `jitter_pct` of itself. The result never exceeds the cap.
    pub fn backoff_delay(&self, retry: u32, jitter_sample: f64) -> Duration {
        let exp = 2_u64.saturating_pow(retry.max(1) - 1);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let spread = delay as f64 * self.jitter_pct * jitter_sample.clamp(-1.0, 1.0);
        let jittered = (delay as f64 + spread).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(jittered.round() as u64)
    }

    /// `backoff_delay` with a fresh jitter sample.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let sample = if self.jitter_pct > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.backoff_delay(retry, sample)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_terminal()
    }
}
