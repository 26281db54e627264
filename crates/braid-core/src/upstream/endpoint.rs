//! A single upstream provider endpoint.
//!
//! `Upstream` wraps one provider URL and owns everything that protects it:
//! the circuit breaker, the (shared, named) rate-limit budget handle, the
//! batch coalescer, the vendor quirks table, the per-method support matrix,
//! and the atomically published poller snapshot.

use arc_swap::ArcSwap;
use dashmap::DashSet;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    config::{NodeType, UpstreamConfig, UpstreamGroup},
    types::{JsonRpcRequest, JsonRpcResponse},
    upstream::{
        batch::BatchCoalescer,
        circuit_breaker::{CircuitBreaker, CircuitState},
        errors::UpstreamError,
        http_client::HttpClient,
        poller::ChainSnapshot,
        rate_limit::RateLimitBudget,
    },
    utils::glob,
};

pub struct Upstream {
    id: Arc<str>,
    config: UpstreamConfig,
    http_client: Arc<HttpClient>,
    circuit_breaker: CircuitBreaker,
    budget: Option<Arc<RateLimitBudget>>,
    batcher: Option<BatchCoalescer>,
    /// Latest poller state; swapped atomically, read lock-free.
    chain_state: ArcSwap<ChainSnapshot>,
    /// Methods this upstream was observed to reject with `method not
    /// found`; consulted by `supports` when auto-ignore is enabled.
    auto_ignored: DashSet<String>,
}

impl Upstream {
    #[must_use]
    pub fn new(
        config: UpstreamConfig,
        http_client: Arc<HttpClient>,
        budget: Option<Arc<RateLimitBudget>>,
    ) -> Self {
        let batcher = config.supports_batch.then(|| {
            BatchCoalescer::spawn(
                Arc::clone(&http_client),
                config.endpoint.clone(),
                config.batch_max_size,
                Duration::from_millis(config.batch_max_wait_ms),
                Duration::from_secs(config.timeout_seconds),
            )
        });

        Self {
            id: Arc::from(config.id.as_str()),
            circuit_breaker: CircuitBreaker::new(&config.circuit_breaker),
            budget,
            batcher,
            chain_state: ArcSwap::from_pointee(ChainSnapshot::default()),
            auto_ignored: DashSet::new(),
            http_client,
            config,
        }
    }

    #[must_use]
    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    #[must_use]
    pub fn group(&self) -> UpstreamGroup {
        self.config.group
    }

    /// Current poller snapshot (never torn; may be default before the
    /// first successful poll).
    #[must_use]
    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.chain_state.load_full()
    }

    /// Publishes a fresh poller snapshot.
    pub fn publish_snapshot(&self, latest: u64, finalized: u64, last_error: Option<String>) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .ok();
        self.chain_state.store(Arc::new(ChainSnapshot {
            latest,
            finalized,
            last_success_ms: now_ms,
            last_error,
        }));
    }

    /// Records a failed poll without discarding the last known heads.
    pub fn publish_poll_error(&self, error: String) {
        let previous = self.chain_state.load_full();
        self.chain_state.store(Arc::new(ChainSnapshot {
            last_error: Some(error),
            ..(*previous).clone()
        }));
    }

    /// Returns whether this upstream serves `method`.
    ///
    /// Allow globs are consulted first, then ignore globs, then the
    /// auto-ignore cache of methods the upstream rejected at runtime.
    #[must_use]
    pub fn supports(&self, method: &str) -> bool {
        if self.config.auto_ignore_unsupported_methods && self.auto_ignored.contains(method) {
            return false;
        }
        if glob::matches_any(&self.config.allow_methods, method) {
            return true;
        }
        if let Some(ignored) = &self.config.ignore_methods {
            if glob::matches_any(ignored, method) {
                return false;
            }
        }
        true
    }

    /// Returns whether this upstream can serve data at `block`.
    ///
    /// Full nodes only retain `max_available_recent_blocks`; archive nodes
    /// serve everything.
    #[must_use]
    pub fn can_serve_block(&self, block: u64) -> bool {
        if self.config.node_type == NodeType::Archive {
            return true;
        }
        let Some(recent) = self.config.max_available_recent_blocks else {
            return true;
        };
        let latest = self.snapshot().latest;
        // Before the first poll completes the horizon is unknown; let the
        // request through rather than starving the upstream.
        latest == 0 || block >= latest.saturating_sub(recent)
    }

    /// Returns whether `error` is listed as retryable by this vendor's
    /// quirks table.
    #[must_use]
    pub fn vendor_retryable(&self, error: &UpstreamError) -> bool {
        match error {
            UpstreamError::Rpc(code, _) => {
                self.config.vendor.retryable_error_codes.contains(code)
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Forwards one JSON-RPC request through the full protection stack:
    /// support matrix → rate-limit budget → circuit breaker → dispatch.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::UnsupportedMethod`] if the method is filtered
    /// - [`UpstreamError::RateLimitExceeded`] if the budget rejects it
    /// - [`UpstreamError::CircuitOpen`] if the breaker blocks it
    /// - classification of the HTTP/RPC outcome otherwise
    pub async fn forward(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, UpstreamError> {
        if !self.supports(&request.method) {
            return Err(UpstreamError::UnsupportedMethod(request.method.clone()));
        }

        if let Some(budget) = &self.budget {
            budget.acquire(&request.method).await?;
        }

        if !self.circuit_breaker.try_acquire() {
            return Err(UpstreamError::CircuitOpen);
        }

        let result = match &self.batcher {
            Some(batcher) => batcher.dispatch(request.clone()).await,
            None => self.send_single(request).await,
        };

        match result {
            Ok(response) => {
                if let Some(error) = &response.error {
                    let rpc_error = UpstreamError::Rpc(error.code, error.message.clone());

                    if error.code == -32601 && self.config.auto_ignore_unsupported_methods {
                        debug!(
                            upstream = %self.id,
                            method = %request.method,
                            "caching method as unsupported after 'method not found'"
                        );
                        self.auto_ignored.insert(request.method.clone());
                        self.circuit_breaker.on_success();
                        return Err(UpstreamError::UnsupportedMethod(request.method.clone()));
                    }

                    if rpc_error.should_trip_breaker() {
                        self.circuit_breaker.on_failure();
                    } else {
                        // The upstream answered; only the payload is an
                        // error. The probe (if any) proved liveness.
                        self.circuit_breaker.on_success();
                    }
                    return Err(rpc_error);
                }

                self.circuit_breaker.on_success();
                let mut response = response;
                response.serving_upstream = Some(Arc::clone(&self.id));
                response.upstream_block = Some(self.snapshot().latest);
                Ok(response)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    self.circuit_breaker.on_failure();
                } else {
                    self.circuit_breaker.on_success();
                }
                Err(e)
            }
        }
    }

    /// Dispatches without the support matrix or budget, for gateway
    /// housekeeping traffic (state polling). The circuit breaker is
    /// intentionally bypassed too: polls are how an unhealthy upstream
    /// proves recovery.
    pub(crate) async fn dispatch_raw(
        &self,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let response = self.send_single(request).await?;
        if let Some(error) = &response.error {
            return Err(UpstreamError::Rpc(error.code, error.message.clone()));
        }
        Ok(response)
    }

    async fn send_single(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, UpstreamError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| UpstreamError::InvalidRequest(format!("serialization failed: {e}")))?;

        let bytes = self
            .http_client
            .post_json(
                &self.config.endpoint,
                bytes::Bytes::from(body),
                Duration::from_secs(self.config.timeout_seconds),
            )
            .await?;

        serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::InvalidResponse(format!("invalid json: {e}")))
    }
}
