//! Named rate-limit budgets with auto-tuning.
//!
//! A budget is a set of rules `(method glob, max_count, period, wait_time)`
//! backed by fixed-window counters. Budgets are named globally and shared by
//! reference: every upstream pointing at the same budget name draws from the
//! same windows.
//!
//! Acquisition consumes one permit from the first rule whose method glob
//! matches. When the window is exhausted, the caller waits for the window to
//! roll over if that happens within `wait_time`; otherwise it sleeps
//! `wait_time` and fails with `RateLimitExceeded`.
//!
//! Auto-tune periodically compares the budget's observed throttle rate
//! against a threshold and grows or shrinks the effective `max_count`
//! between the configured floor (the original budget) and `max_budget`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{upstream::errors::UpstreamError, utils::glob};

/// One rule inside a budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRuleConfig {
    /// Method glob this rule applies to (default: `*`).
    #[serde(default = "default_method_glob")]
    pub method: String,

    /// Permits issued per period.
    pub max_count: u32,

    /// Window length in milliseconds (default: 1000).
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Maximum time a caller may wait for the window to roll over
    /// (default: 0, fail fast).
    #[serde(default)]
    pub wait_time_ms: u64,
}

fn default_method_glob() -> String {
    "*".to_string()
}
fn default_period_ms() -> u64 {
    1000
}

/// A named budget: rules plus optional auto-tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub name: String,
    pub rules: Vec<BudgetRuleConfig>,
    #[serde(default)]
    pub auto_tune: Option<AutoTuneConfig>,
}

/// Auto-tune parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTuneConfig {
    /// Evaluation period in seconds (default: 60).
    #[serde(default = "default_adjustment_period_secs")]
    pub adjustment_period_secs: u64,

    /// Throttle rate above which capacity shrinks (default: 0.1).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Growth factor applied below the threshold (default: 1.05).
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,

    /// Shrink factor applied above the threshold (default: 0.95).
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Upper bound for a tuned `max_count` (default: 100_000).
    #[serde(default = "default_max_budget")]
    pub max_budget: u32,
}

fn default_adjustment_period_secs() -> u64 {
    60
}
fn default_error_rate_threshold() -> f64 {
    0.1
}
fn default_increase_factor() -> f64 {
    1.05
}
fn default_decrease_factor() -> f64 {
    0.95
}
fn default_max_budget() -> u32 {
    100_000
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            adjustment_period_secs: default_adjustment_period_secs(),
            error_rate_threshold: default_error_rate_threshold(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            max_budget: default_max_budget(),
        }
    }
}

/// Fixed-window counter state for one rule.
#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    issued: u32,
}

struct RuleState {
    method: String,
    /// Original configured capacity: the auto-tune floor.
    base_max_count: u32,
    /// Effective capacity; adjusted atomically by auto-tune.
    max_count: AtomicU32,
    period: Duration,
    wait_time: Duration,
    window: Mutex<WindowState>,
}

impl RuleState {
    /// Attempts to take one permit. On exhaustion returns how long until
    /// the current window rolls over.
    fn try_take(&self) -> Result<(), Duration> {
        let cap = self.max_count.load(Ordering::Relaxed);
        let mut window = self.window.lock();

        let elapsed = window.window_start.elapsed();
        if elapsed >= self.period {
            window.window_start = Instant::now();
            window.issued = 0;
        }

        if window.issued < cap {
            window.issued += 1;
            Ok(())
        } else {
            Err(self.period.saturating_sub(window.window_start.elapsed()))
        }
    }
}

/// A shared, named rate-limit budget.
pub struct RateLimitBudget {
    name: String,
    rules: Vec<RuleState>,
    auto_tune: Option<AutoTuneConfig>,
    /// Acquisitions attempted since the last auto-tune evaluation.
    attempts: AtomicU64,
    /// Acquisitions rejected since the last auto-tune evaluation.
    throttled: AtomicU64,
}

impl RateLimitBudget {
    #[must_use]
    pub fn new(config: &BudgetConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| RuleState {
                method: rule.method.clone(),
                base_max_count: rule.max_count,
                max_count: AtomicU32::new(rule.max_count),
                period: Duration::from_millis(rule.period_ms.max(1)),
                wait_time: Duration::from_millis(rule.wait_time_ms),
                window: Mutex::new(WindowState { window_start: Instant::now(), issued: 0 }),
            })
            .collect();

        Self {
            name: config.name.clone(),
            rules,
            auto_tune: config.auto_tune.clone(),
            attempts: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires one permit for `method`.
    ///
    /// Methods matching no rule pass freely. Waits for the window rollover
    /// when it arrives within the rule's `wait_time`; otherwise waits
    /// `wait_time` and fails.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RateLimitExceeded`] when the permit cannot
    /// be obtained within the rule's wait budget.
    pub async fn acquire(&self, method: &str) -> Result<(), UpstreamError> {
        let Some(rule) = self.rules.iter().find(|r| glob::matches(&r.method, method)) else {
            return Ok(());
        };

        self.attempts.fetch_add(1, Ordering::Relaxed);

        match rule.try_take() {
            Ok(()) => Ok(()),
            Err(until_refill) => {
                if until_refill <= rule.wait_time {
                    tokio::time::sleep(until_refill).await;
                    if rule.try_take().is_ok() {
                        return Ok(());
                    }
                } else if !rule.wait_time.is_zero() {
                    tokio::time::sleep(rule.wait_time).await;
                }

                self.throttled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    budget = %self.name,
                    method = %method,
                    "rate limit budget exhausted"
                );
                Err(UpstreamError::RateLimitExceeded {
                    budget: self.name.clone(),
                    method: method.to_string(),
                })
            }
        }
    }

    /// Runs one auto-tune evaluation and resets the observation counters.
    ///
    /// Capacity changes apply atomically and take effect from the next
    /// window; in-flight windows are never resized mid-period.
    pub fn run_adjustment(&self) {
        let Some(tune) = &self.auto_tune else {
            return;
        };

        let attempts = self.attempts.swap(0, Ordering::Relaxed);
        let throttled = self.throttled.swap(0, Ordering::Relaxed);
        if attempts == 0 {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let throttle_rate = throttled as f64 / attempts as f64;
        let grow = throttle_rate < tune.error_rate_threshold;

        for rule in &self.rules {
            let current = rule.max_count.load(Ordering::Relaxed);
            #[allow(clippy::cast_precision_loss)]
            let scaled = if grow {
                f64::from(current) * tune.increase_factor
            } else {
                f64::from(current) * tune.decrease_factor
            };
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let next =
                (scaled.round() as u32).clamp(rule.base_max_count.min(tune.max_budget), tune.max_budget);

            if next != current {
                rule.max_count.store(next, Ordering::Relaxed);
                info!(
                    budget = %self.name,
                    rule = %rule.method,
                    from = current,
                    to = next,
                    throttle_rate,
                    "auto-tuned rate limit capacity"
                );
            }
        }
    }

    /// Current effective capacity of the first rule matching `method`.
    #[must_use]
    pub fn effective_max_count(&self, method: &str) -> Option<u32> {
        self.rules
            .iter()
            .find(|r| glob::matches(&r.method, method))
            .map(|r| r.max_count.load(Ordering::Relaxed))
    }
}

/// Process-wide registry of budgets, keyed by name.
#[derive(Default)]
pub struct BudgetRegistry {
    budgets: DashMap<String, Arc<RateLimitBudget>>,
}

impl BudgetRegistry {
    #[must_use]
    pub fn new(configs: &[BudgetConfig]) -> Self {
        let registry = Self::default();
        for config in configs {
            registry
                .budgets
                .insert(config.name.clone(), Arc::new(RateLimitBudget::new(config)));
        }
        registry
    }

    /// Returns the budget registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RateLimitBudget>> {
        self.budgets.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Spawns the auto-tune loop covering every registered budget.
    ///
    /// Each budget with tuning enabled is evaluated on its own cadence;
    /// the task ticks at the smallest configured period.
    pub fn spawn_auto_tune(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let tick = registry
            .budgets
            .iter()
            .filter_map(|b| b.auto_tune.as_ref().map(|t| t.adjustment_period_secs))
            .min()
            .unwrap_or(60)
            .max(1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for budget in registry.budgets.iter() {
                    budget.run_adjustment();
                }
            }
        })
    }
}
