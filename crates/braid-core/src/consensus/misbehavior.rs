//! Misbehavior tracking with sliding-window disputes and cordoning.
//!
//! Every consensus round in which an upstream disagrees with the winning
//! group records a dispute against the (upstream, method) pair. When the
//! dispute count inside the sliding window reaches the threshold, the pair
//! is cordoned: excluded from selection for the sit-out penalty duration.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::consensus::config::MisbehaviorConfig;

#[derive(Debug)]
struct PairState {
    /// Timestamps of disputes inside the sliding window.
    disputes: VecDeque<Instant>,
    /// When the current cordon ends, if any.
    cordoned_until: Option<Instant>,
}

impl PairState {
    fn new() -> Self {
        Self { disputes: VecDeque::new(), cordoned_until: None }
    }

    fn prune_expired(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(&oldest) = self.disputes.front() {
            if now.duration_since(oldest) > window {
                self.disputes.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_cordoned(&self) -> bool {
        self.cordoned_until.is_some_and(|until| Instant::now() < until)
    }
}

type PairKey = (Arc<str>, Arc<str>);

/// Tracks consensus disputes per (upstream, method) and applies sit-out
/// penalties.
pub struct MisbehaviorTracker {
    config: MisbehaviorConfig,
    pairs: Mutex<HashMap<PairKey, PairState>>,
}

impl MisbehaviorTracker {
    #[must_use]
    pub fn new(config: MisbehaviorConfig) -> Self {
        Self { config, pairs: Mutex::new(HashMap::new()) }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.dispute_window_secs)
    }

    fn penalty(&self) -> Duration {
        Duration::from_secs(self.config.sit_out_penalty_secs)
    }

    /// Records a dispute. Returns `true` if this dispute triggered a
    /// cordon.
    pub fn record_dispute(&self, upstream: &Arc<str>, method: &Arc<str>) -> bool {
        let mut pairs = self.pairs.lock();
        let state = pairs
            .entry((Arc::clone(upstream), Arc::clone(method)))
            .or_insert_with(PairState::new);

        state.prune_expired(self.window());
        state.disputes.push_back(Instant::now());
        let count = state.disputes.len();

        debug!(
            upstream = %upstream,
            method = %method,
            disputes = count,
            threshold = self.config.dispute_threshold,
            "recorded consensus dispute"
        );

        if count >= self.config.dispute_threshold as usize && !state.is_cordoned() {
            state.cordoned_until = Some(Instant::now() + self.penalty());
            info!(
                upstream = %upstream,
                method = %method,
                sit_out_secs = self.config.sit_out_penalty_secs,
                "upstream cordoned after repeated consensus disputes"
            );
            true
        } else {
            false
        }
    }

    /// Returns whether the pair is currently cordoned.
    #[must_use]
    pub fn is_cordoned(&self, upstream: &str, method: &str) -> bool {
        let pairs = self.pairs.lock();
        pairs
            .iter()
            .any(|((u, m), state)| &**u == upstream && &**m == method && state.is_cordoned())
    }

    /// Current dispute count inside the window for a pair.
    #[must_use]
    pub fn dispute_count(&self, upstream: &str, method: &str) -> usize {
        let mut pairs = self.pairs.lock();
        let window = self.window();
        pairs
            .iter_mut()
            .find(|((u, m), _)| &**u == upstream && &**m == method)
            .map_or(0, |(_, state)| {
                state.prune_expired(window);
                state.disputes.len()
            })
    }
}
