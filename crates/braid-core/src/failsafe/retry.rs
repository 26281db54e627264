//! Retry backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay before the second attempt (default: 100ms).
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Exponential backoff factor (default: 1.2).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for any single backoff delay (default: 3s).
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,

    /// Uniform jitter added to each delay (default: 0).
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    100
}
fn default_backoff_factor() -> f64 {
    1.2
}
fn default_backoff_max_delay_ms() -> u64 {
    3000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
            jitter_ms: 0,
        }
    }
}

impl RetryConfig {
    /// Computes the delay before retry attempt `attempt` (1-based: the
    /// delay taken after the first failure is `backoff_delay(1)`).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(32)).unwrap_or(32);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.delay_ms as f64 * self.backoff_factor.powi(exponent);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let base = (scaled as u64).min(self.backoff_max_delay_ms);

        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            use rand::Rng;
            rand::rng().random_range(0..=self.jitter_ms)
        };

        Duration::from_millis(base.saturating_add(jitter))
    }
}
