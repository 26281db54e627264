//! Normalized gateway configuration.
//!
//! The core does not load files: the server layer hands it a fully
//! populated [`GatewayConfig`] and the [`GatewayConfig::normalize`] pass
//! applies every defaulting rule exactly once, producing the immutable
//! configuration the runtime reads. Nothing mutates configuration after
//! startup except rate-limit capacities, which auto-tune adjusts through
//! their own atomics.
//!
//! Materially important defaulting rules:
//! - `server.http_port = 4000`, `metrics.port = 4001`;
//! - node type defaults to `archive`; full nodes default
//!   `max_available_recent_blocks = 128`;
//! - `ignore_methods = ["*"]` whenever `allow_methods` is set and the user
//!   did not override;
//! - any upstream in group `fallback` activates the default selection
//!   policy for the networks it serves;
//! - CORS defaults to permissive origins with the gateway header set.

use serde::{Deserialize, Serialize};

use crate::{
    cache::{CacheConfig, ConnectorConfig},
    consensus::config::ConsensusConfig,
    failsafe::FailsafeConfig,
    upstream::{
        circuit_breaker::CircuitBreakerConfig, errors::UpstreamError, rate_limit::BudgetConfig,
    },
};

/// HTTP server surface settings (consumed by the transport layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_http_port() -> u16 {
    4000
}
fn default_max_concurrent_requests() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

/// Metrics exporter settings (consumed by the transport layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    4001
}
fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, port: default_metrics_port() }
    }
}

/// CORS settings (consumed by the transport layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_cors_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()]
}
fn default_cors_headers() -> Vec<String> {
    vec![
        "content-type".to_string(),
        "authorization".to_string(),
        "x-braid-secret-token".to_string(),
    ]
}
fn default_cors_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
            allowed_methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
            max_age_secs: default_cors_max_age(),
        }
    }
}

/// Upstream selection group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamGroup {
    #[default]
    Default,
    Fallback,
}

/// Node storage depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Full,
    #[default]
    Archive,
}

/// Vendor-specific quirks applied at dispatch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VendorQuirks {
    /// RPC error codes this vendor returns for transient conditions; the
    /// classifier treats them as retryable regardless of the generic rules.
    #[serde(default)]
    pub retryable_error_codes: Vec<i32>,
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Stable identifier; used in metrics, logs, and tie-breaking.
    pub id: String,

    /// HTTP endpoint URL.
    pub endpoint: String,

    /// Networks this upstream serves (network ids).
    pub networks: Vec<String>,

    #[serde(default)]
    pub group: UpstreamGroup,

    #[serde(default)]
    pub node_type: NodeType,

    /// For full nodes: how many recent blocks are queryable. Normalized to
    /// 128 when unset on a full node; archive nodes leave it `None`.
    #[serde(default)]
    pub max_available_recent_blocks: Option<u64>,

    /// Method globs this upstream accepts; empty means everything.
    #[serde(default)]
    pub allow_methods: Vec<String>,

    /// Method globs this upstream rejects. Normalized to `["*"]` when
    /// `allow_methods` is set and the user left this empty.
    #[serde(default)]
    pub ignore_methods: Option<Vec<String>>,

    /// Cache `method not found` responses as unsupported (default: true).
    #[serde(default = "default_true")]
    pub auto_ignore_unsupported_methods: bool,

    /// Name of the shared rate-limit budget, if any.
    #[serde(default)]
    pub rate_limit_budget: Option<String>,

    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Whether outbound requests may be coalesced into JSON-RPC batches.
    #[serde(default)]
    pub supports_batch: bool,

    /// Maximum requests per outbound batch (default: 10).
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Coalescing window in milliseconds (default: 50).
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// State poller interval in seconds (default: 30).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Finality estimate depth when the upstream lacks the `finalized` tag
    /// (default: 1024).
    #[serde(default = "default_fallback_finality_depth")]
    pub fallback_finality_depth: u64,

    #[serde(default)]
    pub vendor: VendorQuirks,
}

fn default_timeout_seconds() -> u64 {
    30
}
fn default_batch_max_size() -> usize {
    10
}
fn default_batch_max_wait_ms() -> u64 {
    50
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_fallback_finality_depth() -> u64 {
    1024
}
pub(crate) const DEFAULT_MAX_RECENT_BLOCKS: u64 = 128;

/// Selection policy scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Whether the policy filter runs; normalization turns this on when a
    /// fallback upstream serves the network.
    #[serde(default)]
    pub enabled: bool,

    /// Policy evaluation interval in seconds (default: 60).
    #[serde(default = "default_eval_interval_secs")]
    pub eval_interval_secs: u64,

    /// Evaluate per (network, method) instead of per network.
    #[serde(default)]
    pub eval_per_method: bool,

    /// Periodically re-admit excluded upstreams.
    #[serde(default = "default_true")]
    pub resample_excluded: bool,

    /// Resample interval in seconds (default: 300).
    #[serde(default = "default_resample_interval_secs")]
    pub resample_interval_secs: u64,

    /// Requests admitted per resample (default: 10).
    #[serde(default = "default_resample_count")]
    pub resample_count: u32,
}

fn default_eval_interval_secs() -> u64 {
    60
}
fn default_resample_interval_secs() -> u64 {
    300
}
fn default_resample_count() -> u32 {
    10
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            eval_interval_secs: default_eval_interval_secs(),
            eval_per_method: false,
            resample_excluded: true,
            resample_interval_secs: default_resample_interval_secs(),
            resample_count: default_resample_count(),
        }
    }
}

/// Configuration for one logical network (chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network identifier, e.g. `evm:1`.
    pub id: String,

    /// Ordered failsafe plans; first match wins.
    #[serde(default)]
    pub failsafe: Vec<FailsafeConfig>,

    /// Consensus, if enabled for this network.
    #[serde(default)]
    pub consensus: Option<ConsensusConfig>,

    #[serde(default)]
    pub selection: SelectionConfig,
}

/// Root configuration consumed by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub rate_limiters: Vec<BudgetConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl GatewayConfig {
    /// Applies every defaulting rule, in one pass, producing the final
    /// immutable configuration.
    pub fn normalize(&mut self) {
        for upstream in &mut self.upstreams {
            if upstream.node_type == NodeType::Full
                && upstream.max_available_recent_blocks.is_none()
            {
                upstream.max_available_recent_blocks = Some(DEFAULT_MAX_RECENT_BLOCKS);
            }

            if !upstream.allow_methods.is_empty() && upstream.ignore_methods.is_none() {
                upstream.ignore_methods = Some(vec!["*".to_string()]);
            }
        }

        // A fallback upstream is useless without the selection policy that
        // can promote it, so its presence switches the policy on.
        for network in &mut self.networks {
            let has_fallback = self.upstreams.iter().any(|u| {
                u.group == UpstreamGroup::Fallback && u.networks.contains(&network.id)
            });
            if has_fallback {
                network.selection.enabled = true;
            }
        }

        if self.cache.connectors.is_empty() {
            self.cache.connectors.push(ConnectorConfig::default());
        }
    }

    /// Validates cross-references after normalization.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::ConfigInvalid`] naming the first violation.
    pub fn validate(&self) -> Result<(), UpstreamError> {
        let mut network_ids = std::collections::HashSet::new();
        for network in &self.networks {
            if !network_ids.insert(network.id.as_str()) {
                return Err(UpstreamError::ConfigInvalid(format!(
                    "duplicate network id '{}'",
                    network.id
                )));
            }
            if let Some(consensus) = &network.consensus {
                if consensus.agreement_threshold > consensus.required_participants {
                    return Err(UpstreamError::ConfigInvalid(format!(
                        "network '{}': agreement threshold exceeds participants",
                        network.id
                    )));
                }
            }
        }

        let mut upstream_ids = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            if !upstream_ids.insert(upstream.id.as_str()) {
                return Err(UpstreamError::ConfigInvalid(format!(
                    "duplicate upstream id '{}'",
                    upstream.id
                )));
            }
            for network in &upstream.networks {
                if !network_ids.contains(network.as_str()) {
                    return Err(UpstreamError::ConfigInvalid(format!(
                        "upstream '{}' references unknown network '{network}'",
                        upstream.id
                    )));
                }
            }
            if let Some(budget) = &upstream.rate_limit_budget {
                if !self.rate_limiters.iter().any(|b| &b.name == budget) {
                    return Err(UpstreamError::ConfigInvalid(format!(
                        "upstream '{}' references unknown budget '{budget}'",
                        upstream.id
                    )));
                }
            }
        }

        Ok(())
    }
}
