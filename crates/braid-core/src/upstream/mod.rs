//! Upstream provider management.
//!
//! Everything that touches a single provider lives here:
//! - [`endpoint`]: the `Upstream` type with its protection stack
//! - [`circuit_breaker`]: ratio-based breaker with single-probe recovery
//! - [`rate_limit`]: named token-bucket budgets with auto-tuning
//! - [`batch`]: transparent outbound batch coalescing
//! - [`poller`]: background latest/finalized block tracking
//! - [`metrics`]: sliding-window counters per (upstream, network, method)
//! - [`scoring`]: composite cost used to rank candidates
//! - [`selector`]: policy filtering and resampling over the ranking
//! - [`registry`]: the flat id-keyed upstream store

pub mod batch;
pub mod circuit_breaker;
pub mod endpoint;
pub mod errors;
pub mod http_client;
pub mod latency;
pub mod metrics;
pub mod poller;
pub mod rate_limit;
pub mod registry;
pub mod scoring;
pub mod selector;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use endpoint::Upstream;
pub use errors::UpstreamError;
pub use http_client::HttpClient;
pub use metrics::{MetricsKey, MetricsSnapshot, MetricsTracker};
pub use rate_limit::{BudgetConfig, BudgetRegistry, RateLimitBudget};
pub use registry::UpstreamRegistry;
pub use scoring::ScoreMultiplierConfig;
pub use selector::{DefaultSelectionPolicy, SelectionPolicy, Selector};
