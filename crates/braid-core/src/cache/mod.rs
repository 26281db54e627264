//! Finality-aware response caching.
//!
//! The cache keys entries by `(network, method, fingerprint, block ref)`
//! and scopes every decision through policy matching (first declaration
//! wins). Writes are best-effort: a backend failure degrades the request to
//! miss semantics, is counted, and never bubbles up.

pub mod policy;
pub mod single_flight;
pub mod store;

pub use policy::{CacheConfig, CachePolicyConfig};
pub use single_flight::{Flight, SingleFlight};
pub use store::{ConnectorConfig, KvStore, MemoryStore, StoreError};

use ahash::AHashMap;
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, warn};

use crate::{
    fingerprint,
    types::{Finality, JsonRpcResponse},
    utils::block_param::BlockRef,
};

/// The network-wide response cache.
pub struct ResponseCache {
    policies: Vec<CachePolicyConfig>,
    connectors: AHashMap<String, Arc<dyn KvStore>>,
    single_flight: SingleFlight,
    /// Backend failures observed (reads and writes combined).
    backend_errors: AtomicU64,
}

impl ResponseCache {
    /// Builds the cache from normalized configuration, instantiating a
    /// memory connector per declared connector id.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut connectors: AHashMap<String, Arc<dyn KvStore>> = AHashMap::new();
        for connector in &config.connectors {
            connectors.insert(
                connector.id.clone(),
                Arc::new(MemoryStore::new(connector.max_items)) as Arc<dyn KvStore>,
            );
        }
        Self {
            policies: config.policies.clone(),
            connectors,
            single_flight: SingleFlight::new(),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Registers an externally provided backend under a connector id,
    /// replacing the default memory driver for that id.
    pub fn register_connector(&mut self, id: impl Into<String>, store: Arc<dyn KvStore>) {
        self.connectors.insert(id.into(), store);
    }

    /// Single-flight coordination map for cache-miss deduplication.
    #[must_use]
    pub fn single_flight(&self) -> &SingleFlight {
        &self.single_flight
    }

    /// Whether fingerprinting may resolve symbolic block tags for this
    /// method: true only when some policy covering the method opts in.
    #[must_use]
    pub fn should_resolve_tags(&self, network: &str, method: &str) -> bool {
        self.policies.iter().any(|p| {
            p.resolve_block_tags
                && crate::utils::glob::matches(&p.method, method)
                && crate::utils::glob::matches(&p.network, network)
        })
    }

    /// Number of backend failures observed so far.
    #[must_use]
    pub fn backend_error_count(&self) -> u64 {
        self.backend_errors.load(Ordering::Relaxed)
    }

    fn entry_key(network: &str, method: &str, fp: u64, block_ref: Option<&BlockRef>) -> String {
        let block = block_ref.map_or_else(|| "-".to_string(), BlockRef::as_key_segment);
        format!("{network}:{method}:{}:{block}", fingerprint::as_key_segment(fp))
    }

    /// Looks up a cached response.
    ///
    /// `finality` is the finality the request would have if served now
    /// (derived from the method class and the network's finalized head);
    /// it selects the policy and thereby the connector.
    pub async fn get(
        &self,
        network: &str,
        method: &str,
        fp: u64,
        block_ref: Option<&BlockRef>,
        finality: Finality,
    ) -> Option<JsonRpcResponse> {
        let policy = policy::match_policy(&self.policies, method, network, finality)?;
        let store = self.connectors.get(&policy.connector)?;
        let key = Self::entry_key(network, method, fp, block_ref);

        let bytes = match store.get(&key).await {
            Ok(found) => found?,
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache read failed, degrading to miss");
                return None;
            }
        };

        match serde_json::from_slice::<JsonRpcResponse>(&bytes) {
            Ok(mut response) => {
                response.finality = Some(finality);
                debug!(key = %key, "cache hit");
                Some(response)
            }
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache entry corrupt, evicting");
                let _ = store.delete(&key).await;
                None
            }
        }
    }

    /// Writes a successful response, if a policy accepts it.
    ///
    /// Realtime responses are only written when the policy sets a TTL;
    /// everything else takes the policy TTL as-is (`None` = no expiry,
    /// which normalization only allows for finalized-capable policies).
    pub async fn set(
        &self,
        network: &str,
        method: &str,
        fp: u64,
        block_ref: Option<&BlockRef>,
        finality: Finality,
        response: &JsonRpcResponse,
    ) {
        if response.error.is_some() || response.result.is_none() {
            return;
        }

        let Some(policy) = policy::match_policy(&self.policies, method, network, finality) else {
            return;
        };

        // Realtime data changes every block; without an explicit (typically
        // sub-second) TTL the write is skipped entirely.
        if finality == Finality::Realtime && policy.ttl().is_none() {
            return;
        }

        let Some(store) = self.connectors.get(&policy.connector) else {
            return;
        };

        let payload = match serde_json::to_vec(response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(method = %method, error = %e, "response serialization failed, skipping cache write");
                return;
            }
        };

        if !policy.size_within_bounds(payload.len()) {
            debug!(
                method = %method,
                size = payload.len(),
                "payload outside policy size bounds, skipping cache write"
            );
            return;
        }

        let key = Self::entry_key(network, method, fp, block_ref);
        if let Err(e) = store.set(&key, Bytes::from(payload), policy.ttl()).await {
            self.backend_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "cache write failed");
        }
    }
}
