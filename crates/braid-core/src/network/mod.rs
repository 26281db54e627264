//! Network orchestration and the gateway entry point.
//!
//! A [`Network`] binds one chain's selector, failsafe executor, optional
//! consensus engine, and cache handle into the request lifecycle:
//!
//! `forward → cache lookup → selector → failsafe plan → upstream(s) →
//! response → cache write → metrics update`
//!
//! The [`Gateway`] is the top-level value owning the process-wide
//! registries (upstreams, budgets, metrics, cache) plus one network per
//! configured chain; it is the only thing the transport layer talks to.

use ahash::AHashMap;
use std::sync::{atomic::AtomicBool, Arc};
use tracing::debug;

use crate::{
    cache::{Flight, ResponseCache},
    catalog,
    config::GatewayConfig,
    consensus::ConsensusEngine,
    failsafe::FailsafeExecutor,
    fingerprint,
    types::{Directives, Finality, JsonRpcRequest, JsonRpcResponse},
    upstream::{
        endpoint::Upstream,
        errors::UpstreamError,
        http_client::HttpClient,
        metrics::MetricsTracker,
        poller,
        rate_limit::BudgetRegistry,
        registry::UpstreamRegistry,
        selector::{DefaultSelectionPolicy, Selector},
        ScoreMultiplierConfig,
    },
    utils::block_param::{BlockRef, BlockTag},
};

/// One logical chain served by a set of upstreams.
pub struct Network {
    id: Arc<str>,
    selector: Selector,
    executor: FailsafeExecutor,
    consensus: Option<ConsensusEngine>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsTracker>,
}

impl Network {
    /// Forwards one request through the full pipeline.
    ///
    /// Returns `Ok` for every response carrying a JSON-RPC envelope,
    /// including upstream-originated error envelopes shared through
    /// single-flight; returns `Err` for gateway-level failures the caller
    /// should map to the private error namespace.
    pub async fn forward(
        &self,
        request: &JsonRpcRequest,
        directives: &Directives,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let spec = catalog::lookup(&request.method);

        let resolver_head = self.metrics.network_head(&self.id);
        let resolver_finalized = self.metrics.network_finalized(&self.id);
        let resolve = |tag: BlockTag| match tag {
            BlockTag::Latest | BlockTag::Pending => {
                (resolver_head > 0).then_some(resolver_head)
            }
            BlockTag::Finalized | BlockTag::Safe => {
                (resolver_finalized > 0).then_some(resolver_finalized)
            }
            BlockTag::Earliest => Some(0),
        };
        let use_resolver = spec.is_some()
            && self.cache.should_resolve_tags(&self.id, &request.method);
        let fp = fingerprint::fingerprint(
            &self.id,
            request,
            use_resolver.then_some(&resolve as fingerprint::TagResolver<'_>),
        );

        let request_ref =
            spec.and_then(|s| catalog::request_block_ref(s, request.params.as_ref()));
        let read_finality = spec.map_or(Finality::Unknown, |s| {
            catalog::classify_finality(
                s.finality_class,
                request_ref.as_ref(),
                (resolver_finalized > 0).then_some(resolver_finalized),
            )
        });

        if directives.skip_cache {
            return self.dispatch(request, directives, read_finality, request_ref.as_ref(), fp, None).await;
        }

        if let Some(mut hit) = self
            .cache
            .get(&self.id, &request.method, fp, request_ref.as_ref(), read_finality)
            .await
        {
            hit.id = Arc::clone(&request.id);
            return Ok(hit);
        }

        // Concurrent misses on this fingerprint wait for the leader and
        // share its envelope.
        match self.cache.single_flight().begin(fp).await {
            Flight::Shared(mut shared) => {
                debug!(network = %self.id, method = %request.method, "joined in-flight request");
                shared.id = Arc::clone(&request.id);
                Ok(shared)
            }
            Flight::Leader(guard) => {
                self.dispatch(request, directives, read_finality, request_ref.as_ref(), fp, Some(guard))
                    .await
            }
        }
    }

    async fn dispatch(
        &self,
        request: &JsonRpcRequest,
        directives: &Directives,
        read_finality: Finality,
        request_ref: Option<&BlockRef>,
        fp: u64,
        guard: Option<crate::cache::single_flight::FlightGuard>,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let cordons = self.consensus.as_ref().and_then(ConsensusEngine::misbehavior);
        let candidates = self.selector.candidates(
            &request.method,
            directives,
            request_ref.and_then(BlockRef::number),
            cordons.map(|tracker| &**tracker),
        );

        if candidates.is_empty() {
            return Err(UpstreamError::PolicyExcluded);
        }

        let engine = self
            .consensus
            .as_ref()
            .filter(|engine| engine.applies_to(&request.method));

        let result = match engine {
            Some(engine) => {
                let request = Arc::new(request.clone());
                engine.execute(&request, &candidates).await
            }
            None => {
                self.executor
                    .execute(request, read_finality, candidates, directives)
                    .await
            }
        };

        match result {
            Ok(mut response) => {
                let finality = self.write_finality(request, &response);
                response.finality = Some(finality);

                if !directives.skip_cache {
                    let write_ref = catalog::lookup(&request.method)
                        .and_then(|s| catalog::response_block_ref(s, response.result.as_ref()))
                        .or_else(|| request_ref.cloned());
                    self.cache
                        .set(
                            &self.id,
                            &request.method,
                            fp,
                            write_ref.as_ref().or(request_ref),
                            finality,
                            &response,
                        )
                        .await;
                }

                if let Some(guard) = guard {
                    guard.publish(&response);
                }
                Ok(response)
            }
            Err(error) => {
                // Followers share the client-facing error envelope; the
                // leader's caller keeps the typed error.
                if let Some(guard) = guard {
                    guard.publish(&error.to_response(Arc::clone(&request.id)));
                }
                Err(error)
            }
        }
    }

    /// Finality of a response at write time, derived from the method class
    /// and the serving upstream's poller state.
    fn write_finality(&self, request: &JsonRpcRequest, response: &JsonRpcResponse) -> Finality {
        let Some(spec) = catalog::lookup(&request.method) else {
            return Finality::Unknown;
        };

        let block_ref = catalog::response_block_ref(spec, response.result.as_ref())
            .or_else(|| catalog::request_block_ref(spec, request.params.as_ref()));

        let finalized = response
            .serving_upstream
            .as_deref()
            .map_or(0, |id| {
                self.selector_registry()
                    .get(id)
                    .map_or(0, |upstream| upstream.snapshot().finalized)
            });

        catalog::classify_finality(
            spec.finality_class,
            block_ref.as_ref(),
            (finalized > 0).then_some(finalized),
        )
    }

    fn selector_registry(&self) -> &Arc<UpstreamRegistry> {
        self.selector.registry()
    }
}

/// The top-level gateway value: registries plus one network per chain.
pub struct Gateway {
    networks: AHashMap<String, Arc<Network>>,
    registry: Arc<UpstreamRegistry>,
    budgets: Arc<BudgetRegistry>,
    metrics: Arc<MetricsTracker>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Gateway {
    /// Builds the gateway from a configuration object, normalizing and
    /// validating it, and spawns the background machinery (state pollers,
    /// budget auto-tune).
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::ConfigInvalid`] when validation fails.
    pub fn from_config(mut config: GatewayConfig) -> Result<Self, UpstreamError> {
        config.normalize();
        config.validate()?;

        let http_client = Arc::new(HttpClient::new()?);
        let budgets = Arc::new(BudgetRegistry::new(&config.rate_limiters));
        let metrics = Arc::new(MetricsTracker::new(
            crate::upstream::metrics::DEFAULT_WINDOW_SECS,
        ));

        let upstreams: Vec<Arc<Upstream>> = config
            .upstreams
            .iter()
            .map(|upstream_config| {
                let budget = upstream_config
                    .rate_limit_budget
                    .as_deref()
                    .and_then(|name| budgets.get(name));
                Arc::new(Upstream::new(
                    upstream_config.clone(),
                    Arc::clone(&http_client),
                    budget,
                ))
            })
            .collect();
        let registry = Arc::new(UpstreamRegistry::new(upstreams));

        let cache = Arc::new(ResponseCache::from_config(&config.cache));

        let mut networks = AHashMap::new();
        for network_config in &config.networks {
            let id: Arc<str> = Arc::from(network_config.id.as_str());

            let selector = Selector::new(
                Arc::clone(&id),
                network_config.selection.clone(),
                ScoreMultiplierConfig::default(),
                Arc::new(DefaultSelectionPolicy::default()),
                Arc::clone(&registry),
                Arc::clone(&metrics),
            );

            let executor = FailsafeExecutor::new(
                Arc::clone(&id),
                network_config.failsafe.clone(),
                Arc::clone(&metrics),
            );

            let consensus = network_config.consensus.clone().map(|consensus_config| {
                ConsensusEngine::new(Arc::clone(&id), consensus_config, Arc::clone(&metrics))
            });

            networks.insert(
                network_config.id.clone(),
                Arc::new(Network {
                    id,
                    selector,
                    executor,
                    consensus,
                    cache: Arc::clone(&cache),
                    metrics: Arc::clone(&metrics),
                }),
            );
        }

        let mut background = Vec::new();
        for upstream in registry.iter() {
            background.push(poller::spawn(Arc::clone(upstream), Arc::clone(&metrics)));
        }
        background.push(budgets.spawn_auto_tune());

        Ok(Self { networks, registry, budgets, metrics, background })
    }

    /// The in-process entry point the transport layer calls.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for unknown networks, and the pipeline's
    /// typed errors otherwise; callers map them to JSON-RPC envelopes via
    /// [`UpstreamError::to_response`].
    pub async fn forward(
        &self,
        network_id: &str,
        request: &JsonRpcRequest,
        directives: &Directives,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let Some(network) = self.networks.get(network_id) else {
            return Err(UpstreamError::InvalidRequest(format!(
                "unknown network '{network_id}'"
            )));
        };
        network.forward(request, directives).await
    }

    /// Runs one poll cycle for every upstream, synchronously.
    ///
    /// The background pollers do this on their own cadence; tests and
    /// startup warm-up call it directly so selection has fresh heads.
    pub async fn refresh_upstream_state(&self) {
        for upstream in self.registry.iter() {
            let flag = AtomicBool::new(false);
            poller::poll_once(upstream, &self.metrics, &flag).await;
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    #[must_use]
    pub fn upstreams(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn budgets(&self) -> &Arc<BudgetRegistry> {
        &self.budgets
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}
