//! Candidate selection: policy filtering over score-ranked upstreams.
//!
//! The selector snapshots metrics, ranks upstreams by composite score, and
//! runs the network's selection policy over the result. Policy evaluation
//! is cached for the configured interval (per network, or per method when
//! `eval_per_method` is set); between evaluations the cached candidate
//! order is reused, so selection stays cheap on the hot path.
//!
//! Excluded upstreams would otherwise never refresh their metrics, so when
//! resampling is enabled they are re-admitted at the tail of the candidate
//! list for a bounded number of requests every resample interval. Retry,
//! hedging, and consensus fan-out provide the traffic that lets them
//! recover.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    config::{SelectionConfig, UpstreamGroup},
    consensus::misbehavior::MisbehaviorTracker,
    types::Directives,
    upstream::{
        endpoint::Upstream,
        metrics::{MetricsKey, MetricsSnapshot, MetricsTracker},
        registry::UpstreamRegistry,
        scoring::{self, RankedUpstream, ScoreMultiplierConfig},
    },
};

/// What a selection policy sees about one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamView {
    pub id: Arc<str>,
    pub group: UpstreamGroup,
    pub score: f64,
    pub metrics: MetricsSnapshot,
}

/// A pluggable selection policy: a pure function of its inputs.
///
/// The reference system evaluates a user-supplied script here; this trait
/// is the systems-language seam for the same behavior. Implementations
/// must be deterministic for identical inputs.
pub trait SelectionPolicy: Send + Sync {
    /// Returns the admitted upstream ids, in preference order.
    fn select(&self, method: &str, upstreams: &[UpstreamView]) -> Vec<Arc<str>>;
}

/// The built-in selection heuristic.
///
/// Admits `default`-group upstreams below the error-rate and block-lag
/// thresholds; promotes healthy `fallback`-group upstreams when fewer than
/// `min_healthy_threshold` pass; returns the full ranked set when nothing
/// is healthy, leaving recovery to the executor's retry policies.
#[derive(Debug, Clone)]
pub struct DefaultSelectionPolicy {
    pub max_error_rate: f64,
    pub max_block_head_lag: u64,
    pub min_healthy_threshold: usize,
}

impl Default for DefaultSelectionPolicy {
    fn default() -> Self {
        Self { max_error_rate: 0.7, max_block_head_lag: 10, min_healthy_threshold: 1 }
    }
}

impl DefaultSelectionPolicy {
    fn is_healthy(&self, view: &UpstreamView) -> bool {
        view.metrics.error_rate < self.max_error_rate
            && view.metrics.block_head_lag < self.max_block_head_lag
    }
}

impl SelectionPolicy for DefaultSelectionPolicy {
    fn select(&self, _method: &str, upstreams: &[UpstreamView]) -> Vec<Arc<str>> {
        let mut admitted: Vec<Arc<str>> = upstreams
            .iter()
            .filter(|v| v.group == UpstreamGroup::Default && self.is_healthy(v))
            .map(|v| Arc::clone(&v.id))
            .collect();

        if admitted.len() < self.min_healthy_threshold {
            admitted.extend(
                upstreams
                    .iter()
                    .filter(|v| v.group == UpstreamGroup::Fallback && self.is_healthy(v))
                    .map(|v| Arc::clone(&v.id)),
            );
        }

        if admitted.is_empty() {
            return upstreams.iter().map(|v| Arc::clone(&v.id)).collect();
        }
        admitted
    }
}

struct CachedEval {
    at: Instant,
    admitted: Vec<Arc<str>>,
    excluded: Vec<Arc<str>>,
}

struct ResampleState {
    last: Mutex<Instant>,
    remaining: AtomicU32,
}

/// Per-network candidate selector.
pub struct Selector {
    network: Arc<str>,
    config: SelectionConfig,
    weights: ScoreMultiplierConfig,
    policy: Arc<dyn SelectionPolicy>,
    registry: Arc<UpstreamRegistry>,
    metrics: Arc<MetricsTracker>,
    evals: DashMap<String, CachedEval>,
    resample: DashMap<Arc<str>, ResampleState>,
}

impl Selector {
    #[must_use]
    pub fn new(
        network: Arc<str>,
        config: SelectionConfig,
        weights: ScoreMultiplierConfig,
        policy: Arc<dyn SelectionPolicy>,
        registry: Arc<UpstreamRegistry>,
        metrics: Arc<MetricsTracker>,
    ) -> Self {
        Self {
            network,
            config,
            weights,
            policy,
            registry,
            metrics,
            evals: DashMap::new(),
            resample: DashMap::new(),
        }
    }

    fn views(&self, method: &str) -> Vec<UpstreamView> {
        let ranked: Vec<RankedUpstream> = self
            .registry
            .for_network(&self.network)
            .iter()
            .map(|upstream| {
                let snapshot = upstream.snapshot();
                let key = MetricsKey {
                    upstream: Arc::clone(upstream.id()),
                    network: Arc::clone(&self.network),
                    method: Arc::from(method),
                };
                let metrics = self.metrics.snapshot(&key, snapshot.latest, snapshot.finalized);
                let score = scoring::score(&metrics, &self.weights);
                RankedUpstream { id: Arc::clone(upstream.id()), score, snapshot: metrics }
            })
            .collect();

        scoring::rank(ranked)
            .into_iter()
            .map(|r| {
                let group = self
                    .registry
                    .get(&r.id)
                    .map_or(UpstreamGroup::Default, |u| u.group());
                UpstreamView { id: r.id, group, score: r.score, metrics: r.snapshot }
            })
            .collect()
    }

    fn evaluate(&self, method: &str) -> (Vec<Arc<str>>, Vec<Arc<str>>) {
        let views = self.views(method);

        if !self.config.enabled {
            // Policy filter off: every upstream is admitted in rank order.
            return (views.iter().map(|v| Arc::clone(&v.id)).collect(), Vec::new());
        }

        let admitted = self.policy.select(method, &views);
        let excluded = views
            .iter()
            .filter(|v| !admitted.contains(&v.id))
            .map(|v| Arc::clone(&v.id))
            .collect();
        (admitted, excluded)
    }

    fn eval_key(&self, method: &str) -> String {
        if self.config.eval_per_method {
            method.to_string()
        } else {
            String::new()
        }
    }

    /// Candidates admitted for resampling, appended at the tail.
    fn resample_candidates(&self, excluded: &[Arc<str>]) -> Vec<Arc<str>> {
        if !self.config.resample_excluded {
            return Vec::new();
        }
        let interval = Duration::from_secs(self.config.resample_interval_secs);

        excluded
            .iter()
            .filter(|id| {
                let state = self.resample.entry(Arc::clone(id)).or_insert_with(|| {
                    // A fresh exclusion starts with a full resample grant so
                    // the upstream's metrics can begin recovering.
                    ResampleState {
                        last: Mutex::new(Instant::now()),
                        remaining: AtomicU32::new(self.config.resample_count),
                    }
                });

                {
                    let mut last = state.last.lock();
                    if last.elapsed() >= interval {
                        *last = Instant::now();
                        state.remaining.store(self.config.resample_count, Ordering::Relaxed);
                    }
                }

                state
                    .remaining
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| r.checked_sub(1))
                    .is_ok()
            })
            .map(Arc::clone)
            .collect()
    }

    /// The registry this selector draws candidates from.
    #[must_use]
    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    /// Produces the ordered candidate list for a request.
    ///
    /// Applies (in order): cached policy evaluation, resample re-admission,
    /// request directives, the per-method support matrix, cordons, and the
    /// block-serving horizon.
    pub fn candidates(
        &self,
        method: &str,
        directives: &Directives,
        block: Option<u64>,
        cordons: Option<&MisbehaviorTracker>,
    ) -> Vec<Arc<Upstream>> {
        let key = self.eval_key(method);
        let interval = Duration::from_secs(self.config.eval_interval_secs);

        let needs_eval = self
            .evals
            .get(&key)
            .is_none_or(|cached| cached.at.elapsed() >= interval);

        if needs_eval {
            let (admitted, excluded) = self.evaluate(method);
            debug!(
                network = %self.network,
                method = %method,
                admitted = admitted.len(),
                excluded = excluded.len(),
                "selection policy evaluated"
            );
            self.evals
                .insert(key.clone(), CachedEval { at: Instant::now(), admitted, excluded });
        }

        let Some(cached) = self.evals.get(&key) else {
            return Vec::new();
        };

        let mut order: Vec<Arc<str>> = cached.admitted.clone();
        order.extend(self.resample_candidates(&cached.excluded));
        drop(cached);

        order
            .into_iter()
            .filter_map(|id| self.registry.get(&id))
            .filter(|upstream| directives.allows_upstream(upstream.id()))
            .filter(|upstream| upstream.supports(method))
            .filter(|upstream| {
                cordons.is_none_or(|tracker| !tracker.is_cordoned(upstream.id(), method))
            })
            .filter(|upstream| block.is_none_or(|b| upstream.can_serve_block(b)))
            .collect()
    }
}
