//! Failsafe plan execution.
//!
//! One executor per network. For every request it selects the matching
//! plan and runs: an outer deadline, a sequential retry loop over the
//! candidate list, and (when configured) a hedged attempt racing the
//! primary against the next candidate after the hedge delay elapses.
//!
//! Attempt accounting: retry attempts are sequential and each consumes the
//! next untried candidate; a hedge races up to `max_parallel - 1` backups
//! and consumes a candidate and an attempt from the same budget per backup
//! fired, so a hedge winner that errors does not extend the retry budget.
//! Cancelling the deadline cancels every in-flight sub-attempt; dropped
//! losers abort their HTTP calls and never record success metrics.

use dashmap::DashMap;
use futures_util::future::select_all;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    failsafe::{select_plan, FailsafeConfig, HedgeConfig},
    types::{Directives, Finality, JsonRpcRequest, JsonRpcResponse},
    upstream::{
        endpoint::Upstream,
        errors::UpstreamError,
        latency::LatencyTracker,
        metrics::{MetricsKey, MetricsTracker},
    },
};

type AttemptOutcome = (Arc<str>, u64, Result<JsonRpcResponse, UpstreamError>);
type AttemptFuture<'a> = Pin<Box<dyn Future<Output = AttemptOutcome> + Send + 'a>>;

pub struct FailsafeExecutor {
    network: Arc<str>,
    plans: Vec<FailsafeConfig>,
    metrics: Arc<MetricsTracker>,
    /// Recent success latencies per upstream, feeding the hedge delay.
    hedge_latency: DashMap<Arc<str>, LatencyTracker>,
}

impl FailsafeExecutor {
    #[must_use]
    pub fn new(network: Arc<str>, plans: Vec<FailsafeConfig>, metrics: Arc<MetricsTracker>) -> Self {
        Self { network, plans, metrics, hedge_latency: DashMap::new() }
    }

    /// Executes a request against the candidate list under the matching
    /// plan.
    ///
    /// # Errors
    ///
    /// Returns the last observed upstream error (wrapped with the attempt
    /// count) after the retry budget is exhausted, or `Timeout` when the
    /// plan deadline expires first.
    pub async fn execute(
        &self,
        request: &JsonRpcRequest,
        finality: Finality,
        candidates: Vec<Arc<Upstream>>,
        directives: &Directives,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        if candidates.is_empty() {
            return Err(UpstreamError::NoHealthyUpstreams);
        }

        let plan = select_plan(&self.plans, &request.method, finality);
        let request = Arc::new(request.clone());

        match plan.timeout() {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.run_attempts(&request, &plan, candidates, directives))
                    .await
                    .map_err(|_| UpstreamError::Timeout)?
            }
            None => self.run_attempts(&request, &plan, candidates, directives).await,
        }
    }

    async fn run_attempts(
        &self,
        request: &Arc<JsonRpcRequest>,
        plan: &FailsafeConfig,
        candidates: Vec<Arc<Upstream>>,
        directives: &Directives,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let max_attempts = plan.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));

        let mut cursor = 0usize;
        let mut attempts = 0u32;
        let mut last_error: Option<UpstreamError> = None;
        let mut empty_response: Option<JsonRpcResponse> = None;

        while attempts < max_attempts {
            let Some(primary) = candidates.get(cursor) else {
                break;
            };
            cursor += 1;

            // Hedge backups are the next untried candidates, bounded by both
            // the plan's parallelism and the remaining attempt budget; they
            // are consumed only if the hedge actually fires.
            let backups: Vec<Arc<Upstream>> = match &plan.hedge {
                Some(hedge) => {
                    let budget = usize::try_from(max_attempts.saturating_sub(attempts + 1))
                        .unwrap_or(usize::MAX);
                    let max_backups = hedge.max_parallel.saturating_sub(1).min(budget);
                    candidates.iter().skip(cursor).take(max_backups).cloned().collect()
                }
                None => Vec::new(),
            };

            let (outcome, hedged) = self
                .attempt(request, primary, &backups, plan.hedge.as_ref())
                .await;
            attempts += 1 + u32::try_from(hedged).unwrap_or(u32::MAX);
            cursor += hedged;

            match outcome {
                Ok(response) => {
                    if directives.retry_empty
                        && !response.has_meaningful_result()
                        && attempts < max_attempts
                        && cursor < candidates.len()
                    {
                        debug!(
                            method = %request.method,
                            upstream = ?response.serving_upstream,
                            "empty result, retrying on next candidate"
                        );
                        empty_response = Some(response);
                        continue;
                    }
                    return Ok(response);
                }
                Err((upstream, error)) => {
                    let retryable = error.is_retryable()
                        || candidates
                            .iter()
                            .find(|u| *u.id() == upstream)
                            .is_some_and(|u| u.vendor_retryable(&error));

                    if !retryable {
                        return Err(error);
                    }
                    warn!(
                        network = %self.network,
                        method = %request.method,
                        upstream = %upstream,
                        error = %error,
                        attempt = attempts,
                        "attempt failed, considering retry"
                    );
                    last_error = Some(error);
                }
            }

            if attempts < max_attempts && cursor < candidates.len() {
                if let Some(retry) = &plan.retry {
                    tokio::time::sleep(retry.backoff_delay(attempts)).await;
                }
            }
        }

        // All candidates empty under retry-empty: the empty answer is the
        // answer.
        if let Some(response) = empty_response {
            return Ok(response);
        }

        match last_error {
            Some(last) => Err(UpstreamError::ExhaustedRetries { attempts, last: Box::new(last) }),
            None => Err(UpstreamError::NoHealthyUpstreams),
        }
    }

    /// Runs one attempt: the primary dispatch, hedged with the backups when
    /// the hedge delay elapses first. Returns the outcome and how many
    /// backups were fired.
    #[allow(clippy::type_complexity)]
    async fn attempt(
        &self,
        request: &Arc<JsonRpcRequest>,
        primary: &Arc<Upstream>,
        backups: &[Arc<Upstream>],
        hedge: Option<&HedgeConfig>,
    ) -> (Result<JsonRpcResponse, (Arc<str>, UpstreamError)>, usize) {
        let Some(hedge) = hedge else {
            return (self.dispatch_tracked(request, primary).await, 0);
        };
        if backups.is_empty() {
            return (self.dispatch_tracked(request, primary).await, 0);
        }

        let delay = self.hedge_delay(primary.id(), hedge);
        let mut primary_fut: AttemptFuture<'_> = Box::pin(Self::dispatch(request, primary));
        let hedge_timer = tokio::time::sleep(delay);
        tokio::pin!(hedge_timer);

        tokio::select! {
            (upstream, latency, result) = &mut primary_fut => {
                (self.settle(request, upstream, latency, result), 0)
            }
            () = &mut hedge_timer => {
                debug!(
                    primary = %primary.id(),
                    backups = backups.len(),
                    delay_ms = delay.as_millis(),
                    "hedge delay elapsed, racing backups"
                );
                let mut futures = vec![primary_fut];
                for backup in backups {
                    futures.push(Box::pin(Self::dispatch(request, backup)) as AttemptFuture<'_>);
                }
                (self.race(request, futures).await, backups.len())
            }
        }
    }

    /// Races in-flight attempts; the first success wins and the remaining
    /// futures are dropped, aborting their requests.
    async fn race(
        &self,
        request: &Arc<JsonRpcRequest>,
        mut futures: Vec<AttemptFuture<'_>>,
    ) -> Result<JsonRpcResponse, (Arc<str>, UpstreamError)> {
        let mut last_failure: Option<(Arc<str>, UpstreamError)> = None;

        while !futures.is_empty() {
            let ((upstream, latency, result), _index, remaining) = select_all(futures).await;
            futures = remaining;

            match self.settle(request, upstream, latency, result) {
                Ok(response) => return Ok(response),
                Err(failure) => last_failure = Some(failure),
            }
        }

        Err(last_failure
            .unwrap_or_else(|| (Arc::from("unknown"), UpstreamError::NoHealthyUpstreams)))
    }

    async fn dispatch(request: &Arc<JsonRpcRequest>, upstream: &Arc<Upstream>) -> AttemptOutcome {
        let start = tokio::time::Instant::now();
        let result = upstream.forward(request).await;
        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        (Arc::clone(upstream.id()), elapsed, result)
    }

    async fn dispatch_tracked(
        &self,
        request: &Arc<JsonRpcRequest>,
        upstream: &Arc<Upstream>,
    ) -> Result<JsonRpcResponse, (Arc<str>, UpstreamError)> {
        let (id, latency, result) = Self::dispatch(request, upstream).await;
        self.settle(request, id, latency, result)
    }

    /// Records metrics for a completed sub-attempt and shapes the outcome.
    fn settle(
        &self,
        request: &Arc<JsonRpcRequest>,
        upstream: Arc<str>,
        latency: u64,
        result: Result<JsonRpcResponse, UpstreamError>,
    ) -> Result<JsonRpcResponse, (Arc<str>, UpstreamError)> {
        let key = MetricsKey {
            upstream: Arc::clone(&upstream),
            network: Arc::clone(&self.network),
            method: Arc::from(request.method.as_str()),
        };
        let series = self.metrics.series(&key);

        match result {
            Ok(response) => {
                series.record_success(latency);
                self.hedge_latency
                    .entry(Arc::clone(&upstream))
                    .or_insert_with(|| LatencyTracker::new(1000))
                    .record(latency);
                Ok(response)
            }
            Err(error) => {
                if error.is_throttle() {
                    series.record_throttle();
                } else if error.should_penalize_upstream() {
                    series.record_error();
                }
                Err((upstream, error))
            }
        }
    }

    /// Hedge delay: the configured latency quantile of the primary's
    /// recent successes, clamped; the fixed delay when history is thin.
    fn hedge_delay(&self, upstream: &Arc<str>, hedge: &HedgeConfig) -> Duration {
        let dynamic = self
            .hedge_latency
            .get(upstream)
            .and_then(|tracker| tracker.percentile(hedge.quantile));

        let millis = match dynamic {
            Some(quantile_ms) => quantile_ms.clamp(hedge.min_delay_ms, hedge.max_delay_ms),
            None => hedge.delay_ms,
        };
        Duration::from_millis(millis)
    }
}
