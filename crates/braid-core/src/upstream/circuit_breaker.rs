//! Circuit breaker protecting a single upstream endpoint.
//!
//! Three-state model:
//! - `Closed` -> `Open`: when the failure ratio over the rolling outcome
//!   window reaches `failure_ratio` (with at least `min_throughput`
//!   observed outcomes)
//! - `Open` -> `HalfOpen`: after `half_open_after` elapses
//! - `HalfOpen` -> `Closed`: the single admitted probe succeeds
//! - `HalfOpen` -> `Open`: the probe fails
//!
//! While `Open`, zero requests are admitted. While `HalfOpen`, exactly one
//! probe is admitted; concurrent callers see `CircuitOpen` until the probe
//! resolves.

use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use serde::{Deserialize, Serialize};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the rolling window that opens the circuit
    /// (default: 0.5).
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    /// Number of rolling outcomes considered (default: 20).
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Minimum outcomes observed before the ratio applies (default: 5).
    #[serde(default = "default_min_throughput")]
    pub min_throughput: usize,

    /// Time spent open before admitting a half-open probe
    /// (default: 300s).
    #[serde(default = "default_half_open_after_secs")]
    pub half_open_after_secs: u64,
}

fn default_failure_ratio() -> f64 {
    0.5
}
fn default_window_size() -> usize {
    20
}
fn default_min_throughput() -> usize {
    5
}
fn default_half_open_after_secs() -> u64 {
    300
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: default_failure_ratio(),
            window_size: default_window_size(),
            min_throughput: default_min_throughput(),
            half_open_after_secs: default_half_open_after_secs(),
        }
    }
}

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests are allowed through.
    Closed,
    /// Failure ratio exceeded, requests are blocked.
    Open,
    /// Recovery mode, a single probe tests the upstream.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Rolling window of outcomes, `true` = failure.
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    /// Whether the single half-open probe has been handed out.
    probe_in_flight: bool,
}

/// Circuit breaker with ratio-based opening and single-probe recovery.
///
/// All mutable state lives under one short-critical-section mutex so state
/// transitions are atomic; there is no lock held across awaits.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_ratio: f64,
    window_size: usize,
    min_throughput: usize,
    half_open_after: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_ratio: config.failure_ratio,
            window_size: config.window_size.max(1),
            min_throughput: config.min_throughput.max(1),
            half_open_after: Duration::from_secs(config.half_open_after_secs),
        }
    }

    /// Decides whether a request may proceed.
    ///
    /// Returns `false` while open (before `half_open_after`) and while a
    /// half-open probe is already in flight.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed());
                if elapsed.is_some_and(|e| e >= self.half_open_after) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful outcome; closes the circuit from half-open.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner.outcomes, self.window_size, false);
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!("circuit breaker closed after successful probe");
            }
        }
    }

    /// Records a failed outcome; may open the circuit.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!("circuit breaker re-opened after failed probe");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                Self::push_outcome(&mut inner.outcomes, self.window_size, true);

                let total = inner.outcomes.len();
                let failures = inner.outcomes.iter().filter(|&&f| f).count();
                #[allow(clippy::cast_precision_loss)]
                let ratio = failures as f64 / total as f64;

                if total >= self.min_throughput && ratio >= self.failure_ratio {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures,
                        total,
                        ratio,
                        "circuit breaker opened after reaching failure ratio"
                    );
                }
            }
        }
    }

    /// Returns the current state without mutating it.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn push_outcome(outcomes: &mut VecDeque<bool>, window: usize, failed: bool) {
        if outcomes.len() == window {
            outcomes.pop_front();
        }
        outcomes.push_back(failed);
    }
}
