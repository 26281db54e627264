//! Flat upstream registry.
//!
//! Upstreams are stored once, keyed by id; networks hold id lists. This
//! keeps the ownership graph acyclic (an upstream can serve many networks)
//! and makes per-network lookup a precomputed slice.

use ahash::AHashMap;
use std::sync::Arc;

use crate::upstream::endpoint::Upstream;

pub struct UpstreamRegistry {
    by_id: AHashMap<Arc<str>, Arc<Upstream>>,
    by_network: AHashMap<String, Vec<Arc<Upstream>>>,
}

impl UpstreamRegistry {
    #[must_use]
    pub fn new(upstreams: Vec<Arc<Upstream>>) -> Self {
        let mut by_id = AHashMap::new();
        let mut by_network: AHashMap<String, Vec<Arc<Upstream>>> = AHashMap::new();

        for upstream in upstreams {
            for network in &upstream.config().networks {
                by_network.entry(network.clone()).or_default().push(Arc::clone(&upstream));
            }
            by_id.insert(Arc::clone(upstream.id()), upstream);
        }

        Self { by_id, by_network }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Upstream>> {
        self.by_id.get(id).cloned()
    }

    /// All upstreams serving a network, in configuration order.
    #[must_use]
    pub fn for_network(&self, network: &str) -> &[Arc<Upstream>] {
        self.by_network.get(network).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterates all registered upstreams.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.by_id.values()
    }
}
