//! End-to-end `forward` scenarios against mock upstreams: caching,
//! single-flight deduplication, rate-limit budgets, and fallback
//! promotion.

use braid_core::{
    cache::{CacheConfig, CachePolicyConfig, ConnectorConfig},
    config::{
        GatewayConfig, NetworkConfig, SelectionConfig, UpstreamConfig, UpstreamGroup,
    },
    network::Gateway,
    types::{Directives, JsonRpcRequest},
    upstream::{
        errors::UpstreamError,
        rate_limit::{BudgetConfig, BudgetRuleConfig},
    },
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

use crate::mock_infrastructure::{evm_housekeeping, MockReply, MockRpcServer};

const NETWORK: &str = "evm:1";

fn upstream(id: &str, url: &str) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        endpoint: url.to_string(),
        networks: vec![NETWORK.to_string()],
        group: UpstreamGroup::Default,
        node_type: braid_core::config::NodeType::Archive,
        max_available_recent_blocks: None,
        allow_methods: Vec::new(),
        ignore_methods: None,
        auto_ignore_unsupported_methods: true,
        rate_limit_budget: None,
        timeout_seconds: 5,
        supports_batch: false,
        batch_max_size: 10,
        batch_max_wait_ms: 50,
        circuit_breaker: braid_core::upstream::CircuitBreakerConfig::default(),
        poll_interval_secs: 30,
        fallback_finality_depth: 1024,
        vendor: braid_core::config::VendorQuirks::default(),
    }
}

fn network() -> NetworkConfig {
    NetworkConfig {
        id: NETWORK.to_string(),
        failsafe: Vec::new(),
        consensus: None,
        selection: SelectionConfig::default(),
    }
}

fn chain_id_policy() -> CachePolicyConfig {
    CachePolicyConfig {
        method: "eth_chainId".to_string(),
        network: "*".to_string(),
        finality: Vec::new(),
        ttl_ms: None,
        min_item_size: None,
        max_item_size: None,
        connector: "memory".to_string(),
        resolve_block_tags: false,
    }
}

fn chain_id_request() -> JsonRpcRequest {
    JsonRpcRequest::new("eth_chainId", None, json!(1))
}

#[tokio::test]
async fn test_chain_id_served_from_cache_after_first_call() {
    let server = MockRpcServer::healthy(100, json!("0x1")).await;

    let config = GatewayConfig {
        networks: vec![network()],
        upstreams: vec![upstream("primary", &server.url())],
        cache: CacheConfig {
            connectors: vec![ConnectorConfig::default()],
            policies: vec![chain_id_policy()],
        },
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives::default();

    let first = gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();
    assert_eq!(first.result, Some(json!("0x1")));

    let second = gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();
    assert_eq!(second.result, Some(json!("0x1")));

    // The second call never reached the upstream.
    assert_eq!(server.calls_for("eth_chainId"), 1);
}

#[tokio::test]
async fn test_skip_cache_directive_reaches_upstream_every_time() {
    let server = MockRpcServer::healthy(100, json!("0x1")).await;

    let config = GatewayConfig {
        networks: vec![network()],
        upstreams: vec![upstream("primary", &server.url())],
        cache: CacheConfig {
            connectors: vec![ConnectorConfig::default()],
            policies: vec![chain_id_policy()],
        },
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();
    gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();

    assert_eq!(server.calls_for("eth_chainId"), 2);
}

#[tokio::test]
async fn test_single_flight_deduplicates_concurrent_misses() {
    let server = MockRpcServer::spawn(Arc::new(|method, params| {
        evm_housekeeping(method, params, 100).unwrap_or_else(|| {
            MockReply::result(json!("0xde0b6b3a7640000")).after(Duration::from_millis(100))
        })
    }))
    .await;

    let config = GatewayConfig {
        networks: vec![network()],
        upstreams: vec![upstream("primary", &server.url())],
        ..Default::default()
    };
    let gateway = Arc::new(Gateway::from_config(config).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            let request = JsonRpcRequest::new(
                "eth_getBalance",
                Some(json!(["0xabc0000000000000000000000000000000000abc", "0x64"])),
                json!(1),
            );
            gateway.forward(NETWORK, &request, &Directives::default()).await
        }));
    }

    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("0xde0b6b3a7640000")));
    }

    // One outbound call served all four concurrent requests.
    assert_eq!(server.calls_for("eth_getBalance"), 1);
}

#[tokio::test]
async fn test_rate_limit_budget_waits_then_throttles() {
    let server = MockRpcServer::healthy(100, json!("0x1")).await;

    let mut limited = upstream("limited", &server.url());
    limited.rate_limit_budget = Some("tight".to_string());

    let config = GatewayConfig {
        networks: vec![network()],
        upstreams: vec![limited],
        rate_limiters: vec![BudgetConfig {
            name: "tight".to_string(),
            rules: vec![BudgetRuleConfig {
                method: "*".to_string(),
                max_count: 1,
                period_ms: 5_000,
                wait_time_ms: 500,
            }],
            auto_tune: None,
        }],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();

    let start = std::time::Instant::now();
    let err = gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap_err();
    assert!(matches!(err, UpstreamError::RateLimitExceeded { .. }));
    // The caller waited the rule's wait budget before giving up.
    assert!(start.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn test_fallback_promoted_when_defaults_unhealthy() {
    let dead_responder = |method: &str, params: Option<&serde_json::Value>| {
        evm_housekeeping(method, params, 100)
            .unwrap_or_else(|| MockReply::error(-32603, "internal error"))
    };
    let dead_1 = MockRpcServer::spawn(Arc::new(dead_responder)).await;
    let dead_2 = MockRpcServer::spawn(Arc::new(dead_responder)).await;
    let backup = MockRpcServer::healthy(100, json!("0x1")).await;

    let mut backup_config = upstream("backup", &backup.url());
    backup_config.group = UpstreamGroup::Fallback;

    let mut network_config = network();
    // Re-evaluate the policy on every request and keep resampling out of
    // the way so promotion is the only path to the fallback.
    network_config.selection.eval_interval_secs = 0;
    network_config.selection.resample_excluded = false;

    let config = GatewayConfig {
        networks: vec![network_config],
        upstreams: vec![
            upstream("dead-1", &dead_1.url()),
            upstream("dead-2", &dead_2.url()),
            backup_config,
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    // Warm up every poller so all three upstreams publish the same head
    // and selection is driven purely by error rates.
    gateway.refresh_upstream_state().await;

    // First call: both defaults look healthy, get selected, and fail.
    let err = gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap_err();
    assert!(matches!(
        err,
        UpstreamError::ExhaustedRetries { .. } | UpstreamError::Rpc(_, _)
    ));

    // Second call: their error rates now exceed the policy threshold, so
    // the healthy fallback is promoted.
    let response = gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();
    assert_eq!(response.result, Some(json!("0x1")));
    assert_eq!(response.serving_upstream.as_deref(), Some("backup"));
    assert!(backup.calls_for("eth_chainId") >= 1);
}

#[tokio::test]
async fn test_unknown_network_is_rejected() {
    let config = GatewayConfig::default();
    let gateway = Gateway::from_config(config).unwrap();

    let err = gateway
        .forward("evm:999", &chain_id_request(), &Directives::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_require_upstreams_directive_restricts_selection() {
    let a = MockRpcServer::healthy(100, json!("0xa")).await;
    let b = MockRpcServer::healthy(100, json!("0xb")).await;

    let config = GatewayConfig {
        networks: vec![network()],
        upstreams: vec![upstream("alpha", &a.url()), upstream("beta", &b.url())],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();

    let directives = Directives {
        skip_cache: true,
        require_upstreams: Some("beta".to_string()),
        ..Default::default()
    };
    let response = gateway.forward(NETWORK, &chain_id_request(), &directives).await.unwrap();
    assert_eq!(response.serving_upstream.as_deref(), Some("beta"));
    assert_eq!(a.calls_for("eth_chainId"), 0);
}
