//! Multi-factor upstream scoring.
//!
//! Converts a metrics snapshot into a scalar cost: a weighted sum of
//! normalized factors where **lower is better**. Error rate, P90 latency,
//! throttle rate, block-head lag, and finalization lag are cost terms;
//! total requests is a soft preference rewarding upstreams with proven
//! recent throughput. Ties are broken by upstream id for determinism.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::upstream::metrics::MetricsSnapshot;

/// Weights applied to each normalized factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreMultiplierConfig {
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    #[serde(default = "default_p90_latency")]
    pub p90_latency: f64,
    #[serde(default = "default_throttled_rate")]
    pub throttled_rate: f64,
    #[serde(default = "default_block_head_lag")]
    pub block_head_lag: f64,
    #[serde(default = "default_total_requests")]
    pub total_requests: f64,
    #[serde(default = "default_finalization_lag")]
    pub finalization_lag: f64,
    #[serde(default = "default_overall")]
    pub overall: f64,
}

fn default_error_rate() -> f64 {
    8.0
}
fn default_p90_latency() -> f64 {
    4.0
}
fn default_throttled_rate() -> f64 {
    3.0
}
fn default_block_head_lag() -> f64 {
    2.0
}
fn default_total_requests() -> f64 {
    1.0
}
fn default_finalization_lag() -> f64 {
    1.0
}
fn default_overall() -> f64 {
    1.0
}

impl Default for ScoreMultiplierConfig {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            p90_latency: default_p90_latency(),
            throttled_rate: default_throttled_rate(),
            block_head_lag: default_block_head_lag(),
            total_requests: default_total_requests(),
            finalization_lag: default_finalization_lag(),
            overall: default_overall(),
        }
    }
}

/// Normalization horizons. Lags past the horizon saturate at full cost.
const BLOCK_LAG_HORIZON: f64 = 10.0;
const FINALITY_LAG_HORIZON: f64 = 100.0;
/// P90 latency normalization: log2 scaling over 14 bits (~16s range).
const LATENCY_LOG_RANGE: f64 = 14.0;

/// Normalizes P90 latency to [0, 1] with logarithmic scaling, so the
/// difference between 50ms and 200ms weighs more than 5s vs 6s.
fn latency_cost(p90_ms: u64) -> f64 {
    if p90_ms == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let normalized = (p90_ms as f64).log2() / LATENCY_LOG_RANGE;
    normalized.clamp(0.0, 1.0)
}

fn lag_cost(lag: u64, horizon: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let normalized = lag as f64 / horizon;
    normalized.clamp(0.0, 1.0)
}

/// Soft preference for proven throughput: full cost with zero traffic,
/// approaching zero as the window fills with requests.
fn load_preference(total_requests: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let filled = ((1.0 + total_requests as f64).log2() / 10.0).clamp(0.0, 1.0);
    1.0 - filled
}

/// Computes the composite cost of an upstream. Lower is better.
#[must_use]
pub fn score(snapshot: &MetricsSnapshot, weights: &ScoreMultiplierConfig) -> f64 {
    let sum = weights.error_rate * snapshot.error_rate.clamp(0.0, 1.0)
        + weights.p90_latency * latency_cost(snapshot.p90_latency_ms)
        + weights.throttled_rate * snapshot.throttle_rate.clamp(0.0, 1.0)
        + weights.block_head_lag * lag_cost(snapshot.block_head_lag, BLOCK_LAG_HORIZON)
        + weights.finalization_lag * lag_cost(snapshot.finalization_lag, FINALITY_LAG_HORIZON)
        + weights.total_requests * load_preference(snapshot.total_requests);
    weights.overall * sum
}

/// A scored upstream, ready for ranking.
#[derive(Debug, Clone)]
pub struct RankedUpstream {
    pub id: Arc<str>,
    pub score: f64,
    pub snapshot: MetricsSnapshot,
}

/// Sorts ascending by score, breaking ties by upstream id.
pub fn rank(mut upstreams: Vec<RankedUpstream>) -> Vec<RankedUpstream> {
    upstreams.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    upstreams
}
