//! Failsafe policy composition.
//!
//! A network carries an ordered list of [`FailsafeConfig`] entries. For each
//! request the first entry whose method glob and finality set match becomes
//! the execution plan. The plan composes, outermost first:
//! timeout → retry → hedge → circuit breaker → consensus. Any stage may be
//! absent; the circuit breaker lives on the upstream and consensus on the
//! network, so this module owns the outer three.

mod executor;
mod retry;

pub use executor::FailsafeExecutor;
pub use retry::RetryConfig;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{types::Finality, utils::glob};

/// Hedging stage configuration.
///
/// The hedge delay is the observed latency quantile of recent successes
/// when enough samples exist, clamped to `[min_delay_ms, max_delay_ms]`;
/// otherwise `delay_ms` applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Fixed fallback delay before hedging (default: 100ms).
    #[serde(default = "default_hedge_delay_ms")]
    pub delay_ms: u64,

    /// Latency quantile used to derive the dynamic delay (default: 0.95).
    #[serde(default = "default_hedge_quantile")]
    pub quantile: f64,

    /// Lower clamp for the dynamic delay (default: 100ms).
    #[serde(default = "default_hedge_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper clamp for the dynamic delay (default: effectively unbounded).
    #[serde(default = "default_hedge_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum parallel attempts including the primary (default: 2).
    #[serde(default = "default_hedge_max_parallel")]
    pub max_parallel: usize,
}

fn default_hedge_delay_ms() -> u64 {
    100
}
fn default_hedge_quantile() -> f64 {
    0.95
}
fn default_hedge_min_delay_ms() -> u64 {
    100
}
fn default_hedge_max_delay_ms() -> u64 {
    u64::MAX / 2
}
fn default_hedge_max_parallel() -> usize {
    2
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_hedge_delay_ms(),
            quantile: default_hedge_quantile(),
            min_delay_ms: default_hedge_min_delay_ms(),
            max_delay_ms: default_hedge_max_delay_ms(),
            max_parallel: default_hedge_max_parallel(),
        }
    }
}

/// One failsafe plan, matched by method glob and finality set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailsafeConfig {
    /// Method glob this plan applies to (default: `*`).
    #[serde(default = "default_match_method")]
    pub match_method: String,

    /// Finality classes this plan applies to; empty matches all.
    #[serde(default)]
    pub match_finality: Vec<Finality>,

    /// Overall deadline in milliseconds; absent means no plan timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub hedge: Option<HedgeConfig>,
}

fn default_match_method() -> String {
    "*".to_string()
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            match_method: default_match_method(),
            match_finality: Vec::new(),
            timeout_ms: Some(15_000),
            retry: Some(RetryConfig::default()),
            hedge: None,
        }
    }
}

impl FailsafeConfig {
    /// Returns `true` if this plan matches the request.
    #[must_use]
    pub fn matches(&self, method: &str, finality: Finality) -> bool {
        glob::matches(&self.match_method, method)
            && (self.match_finality.is_empty() || self.match_finality.contains(&finality))
    }

    /// Plan deadline as a `Duration`, if configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Selects the first matching plan from an ordered list.
///
/// Falls back to the default plan when nothing matches, so a request never
/// runs without a deadline and retry budget.
#[must_use]
pub fn select_plan(plans: &[FailsafeConfig], method: &str, finality: Finality) -> FailsafeConfig {
    plans
        .iter()
        .find(|p| p.matches(method, finality))
        .cloned()
        .unwrap_or_default()
}
