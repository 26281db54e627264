//! Cache policy matching.
//!
//! Policies are evaluated in declaration order; the first whose method
//! glob, network glob, and finality set match wins. A request with no
//! matching policy is non-cacheable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{types::Finality, utils::glob};

/// One cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicyConfig {
    /// Method glob (default: `*`).
    #[serde(default = "default_star")]
    pub method: String,

    /// Network glob (default: `*`).
    #[serde(default = "default_star")]
    pub network: String,

    /// Finality classes this policy accepts; empty matches all.
    #[serde(default)]
    pub finality: Vec<Finality>,

    /// Entry TTL in milliseconds. `None` means no expiry, which only makes
    /// sense for `finalized` data; realtime entries without a TTL are not
    /// written at all.
    #[serde(default)]
    pub ttl_ms: Option<u64>,

    /// Minimum serialized payload size in bytes (default: none).
    #[serde(default)]
    pub min_item_size: Option<usize>,

    /// Maximum serialized payload size in bytes (default: none).
    #[serde(default)]
    pub max_item_size: Option<usize>,

    /// Connector id this policy routes to (default: `memory`).
    #[serde(default = "default_connector")]
    pub connector: String,

    /// Whether symbolic block tags may be resolved to concrete numbers
    /// before fingerprinting for methods under this policy.
    #[serde(default)]
    pub resolve_block_tags: bool,
}

fn default_star() -> String {
    "*".to_string()
}
fn default_connector() -> String {
    "memory".to_string()
}

impl CachePolicyConfig {
    /// Returns `true` if this policy covers the given request shape.
    #[must_use]
    pub fn matches(&self, method: &str, network: &str, finality: Finality) -> bool {
        glob::matches(&self.method, method)
            && glob::matches(&self.network, network)
            && (self.finality.is_empty() || self.finality.contains(&finality))
    }

    /// TTL as a `Duration`, if set.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    /// Checks the serialized payload size against this policy's bounds.
    #[must_use]
    pub fn size_within_bounds(&self, size: usize) -> bool {
        self.min_item_size.is_none_or(|min| size >= min)
            && self.max_item_size.is_none_or(|max| size <= max)
    }
}

/// Cache section of the normalized configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub connectors: Vec<super::store::ConnectorConfig>,
    #[serde(default)]
    pub policies: Vec<CachePolicyConfig>,
}

/// Finds the first matching policy in declaration order.
#[must_use]
pub fn match_policy<'a>(
    policies: &'a [CachePolicyConfig],
    method: &str,
    network: &str,
    finality: Finality,
) -> Option<&'a CachePolicyConfig> {
    policies.iter().find(|p| p.matches(method, network, finality))
}
