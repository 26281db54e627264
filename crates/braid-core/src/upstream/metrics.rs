//! Sliding-window metrics per (upstream, network, method).
//!
//! Counters use atomics with a CAS-claimed lazy window reset, so recording
//! is lock-free on the hot path and rates never go negative. The registry
//! also tracks each network's highest observed latest/finalized block so
//! block-head lag and finalization lag can be derived at read time.

use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use crate::upstream::latency::LatencyTracker;

/// Default metric window: 30 minutes.
pub const DEFAULT_WINDOW_SECS: u64 = 1800;

/// Key for one tracked metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricsKey {
    pub upstream: Arc<str>,
    pub network: Arc<str>,
    pub method: Arc<str>,
}

/// Windowed counters for one (upstream, network, method) series.
pub struct SeriesMetrics {
    latency: LatencyTracker,
    total_requests: AtomicU64,
    error_count: AtomicU64,
    throttle_count: AtomicU64,
    /// Nanoseconds since epoch when the current window started.
    window_start_nanos: AtomicU64,
    epoch: Instant,
    window_duration_nanos: u64,
}

impl SeriesMetrics {
    #[must_use]
    pub fn new(window_seconds: u64) -> Self {
        Self {
            latency: LatencyTracker::new(1000),
            total_requests: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            throttle_count: AtomicU64::new(0),
            window_start_nanos: AtomicU64::new(0),
            epoch: Instant::now(),
            window_duration_nanos: window_seconds.saturating_mul(1_000_000_000),
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Lazily resets counters when the window expires.
    ///
    /// CAS claims the reset so exactly one racing thread performs it; a
    /// final `Release` store publishes the cleared counters.
    fn maybe_reset_window(&self) {
        let now = self.now_nanos();
        let window_start = self.window_start_nanos.load(Ordering::Acquire);

        if now.saturating_sub(window_start) > self.window_duration_nanos
            && self
                .window_start_nanos
                .compare_exchange_weak(window_start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.total_requests.store(0, Ordering::Relaxed);
            self.error_count.store(0, Ordering::Relaxed);
            self.throttle_count.store(0, Ordering::Relaxed);
            self.window_start_nanos.store(now, Ordering::Release);
        }
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.maybe_reset_window();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency_ms);
    }

    pub fn record_error(&self) {
        self.maybe_reset_window();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.maybe_reset_window();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.throttle_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.error_count.load(Ordering::Relaxed) as f64 / total as f64
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn throttle_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.throttle_count.load(Ordering::Relaxed) as f64 / total as f64
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn p90_latency_ms(&self) -> Option<u64> {
        self.latency.percentile(0.90)
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.latency.sample_count()
    }
}

/// Point-in-time snapshot of one series, consumed by scoring and policies.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub error_rate: f64,
    pub throttle_rate: f64,
    pub p90_latency_ms: u64,
    pub total_requests: u64,
    pub block_head_lag: u64,
    pub finalization_lag: u64,
}

/// Per-network head state used for lag derivation.
struct NetworkHead {
    latest: AtomicU64,
    finalized: AtomicU64,
}

/// Process-wide metrics registry.
///
/// Many-reader many-writer: series are created on first touch and all
/// updates are atomic.
pub struct MetricsTracker {
    window_seconds: u64,
    series: DashMap<MetricsKey, Arc<SeriesMetrics>>,
    heads: DashMap<Arc<str>, NetworkHead>,
}

impl MetricsTracker {
    #[must_use]
    pub fn new(window_seconds: u64) -> Self {
        Self { window_seconds, series: DashMap::new(), heads: DashMap::new() }
    }

    /// Returns (creating on demand) the series for a key.
    pub fn series(&self, key: &MetricsKey) -> Arc<SeriesMetrics> {
        if let Some(entry) = self.series.get(key) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.series
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SeriesMetrics::new(self.window_seconds)))
                .value(),
        )
    }

    /// Records a network-wide head observation (from any upstream poller).
    ///
    /// Heads are monotonic: stale observations never move them backwards.
    pub fn observe_head(&self, network: &Arc<str>, latest: u64, finalized: u64) {
        let entry = self.heads.entry(Arc::clone(network)).or_insert_with(|| NetworkHead {
            latest: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
        });
        entry.latest.fetch_max(latest, Ordering::Relaxed);
        entry.finalized.fetch_max(finalized, Ordering::Relaxed);
    }

    /// Highest latest block observed for the network.
    #[must_use]
    pub fn network_head(&self, network: &str) -> u64 {
        self.heads.get(network).map_or(0, |h| h.latest.load(Ordering::Relaxed))
    }

    /// Highest finalized block observed for the network.
    #[must_use]
    pub fn network_finalized(&self, network: &str) -> u64 {
        self.heads.get(network).map_or(0, |h| h.finalized.load(Ordering::Relaxed))
    }

    /// Builds a snapshot for scoring, combining windowed counters with lag
    /// derived from the upstream's own poller state.
    #[must_use]
    pub fn snapshot(
        &self,
        key: &MetricsKey,
        upstream_latest: u64,
        upstream_finalized: u64,
    ) -> MetricsSnapshot {
        let series = self.series(key);
        MetricsSnapshot {
            error_rate: series.error_rate(),
            throttle_rate: series.throttle_rate(),
            p90_latency_ms: series.p90_latency_ms().unwrap_or(0),
            total_requests: series.total_requests(),
            block_head_lag: self.network_head(&key.network).saturating_sub(upstream_latest),
            finalization_lag: self
                .network_finalized(&key.network)
                .saturating_sub(upstream_finalized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(upstream: &str, method: &str) -> MetricsKey {
        MetricsKey {
            upstream: Arc::from(upstream),
            network: Arc::from("mainnet"),
            method: Arc::from(method),
        }
    }

    #[test]
    fn test_rates() {
        let series = SeriesMetrics::new(60);
        series.record_success(100);
        series.record_success(100);
        series.record_success(100);
        series.record_error();
        series.record_throttle();

        assert_eq!(series.total_requests(), 5);
        assert!((series.error_rate() - 0.2).abs() < 1e-9);
        assert!((series.throttle_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_heads_are_monotonic() {
        let tracker = MetricsTracker::new(60);
        let network: Arc<str> = Arc::from("mainnet");

        tracker.observe_head(&network, 100, 90);
        tracker.observe_head(&network, 98, 85);
        assert_eq!(tracker.network_head("mainnet"), 100);
        assert_eq!(tracker.network_finalized("mainnet"), 90);

        tracker.observe_head(&network, 105, 95);
        assert_eq!(tracker.network_head("mainnet"), 105);
        assert_eq!(tracker.network_finalized("mainnet"), 95);
    }

    #[test]
    fn test_snapshot_lags() {
        let tracker = MetricsTracker::new(60);
        let network: Arc<str> = Arc::from("mainnet");
        tracker.observe_head(&network, 110, 100);

        let k = key("slow", "eth_call");
        tracker.series(&k).record_success(50);

        let snap = tracker.snapshot(&k, 104, 97);
        assert_eq!(snap.block_head_lag, 6);
        assert_eq!(snap.finalization_lag, 3);
        assert_eq!(snap.total_requests, 1);
    }

    #[test]
    fn test_series_shared_per_key() {
        let tracker = MetricsTracker::new(60);
        let a = tracker.series(&key("up1", "eth_call"));
        let b = tracker.series(&key("up1", "eth_call"));
        assert!(Arc::ptr_eq(&a, &b));

        let c = tracker.series(&key("up1", "eth_getLogs"));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
