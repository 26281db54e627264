//! Hedged dispatch: a slow primary loses the race to the hedge fired at
//! the configured delay.

use braid_core::{
    config::{GatewayConfig, NetworkConfig, SelectionConfig, UpstreamConfig, UpstreamGroup},
    failsafe::{FailsafeConfig, HedgeConfig, RetryConfig},
    network::Gateway,
    types::{Directives, JsonRpcRequest},
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

fn delayed_server(
    delay: Duration,
    result: serde_json::Value,
) -> impl std::future::Future<Output = MockRpcServer> {
    MockRpcServer::spawn(Arc::new(move |method, params| {
        evm_housekeeping(method, params, 100)
            .unwrap_or_else(|| MockReply::result(result.clone()).after(delay))
    }))
}

#[tokio::test]
async fn test_hedge_wins_against_slow_primary() {
    // Primary answers in 500ms; the backup answers in 50ms. With a 100ms
    // hedge delay the backup's response should win at ~150ms.
    let slow = delayed_server(Duration::from_millis(500), json!("0xslow")).await;
    let fast = delayed_server(Duration::from_millis(50), json!("0xfast")).await;

    let config = GatewayConfig {
        networks: vec![NetworkConfig {
            id: NETWORK.to_string(),
            failsafe: vec![FailsafeConfig {
                match_method: "*".to_string(),
                match_finality: Vec::new(),
                timeout_ms: Some(5_000),
                retry: Some(RetryConfig::default()),
                hedge: Some(HedgeConfig {
                    delay_ms: 100,
                    min_delay_ms: 100,
                    ..Default::default()
                }),
            }],
            consensus: None,
            selection: SelectionConfig::default(),
        }],
        upstreams: vec![
            // Ids chosen so the tie-break ranks the slow upstream first.
            upstream("a-slow", &slow.url()),
            upstream("b-fast", &fast.url()),
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();

    let request = JsonRpcRequest::new("eth_chainId", None, json!(1));
    let directives = Directives { skip_cache: true, ..Default::default() };

    let start = std::time::Instant::now();
    let response = gateway.forward(NETWORK, &request, &directives).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(response.result, Some(json!("0xfast")));
    assert_eq!(response.serving_upstream.as_deref(), Some("b-fast"));
    // Well under the primary's 500ms: the hedge raced and won.
    assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
    assert!(elapsed >= Duration::from_millis(100), "took {elapsed:?}");
}

#[tokio::test]
async fn test_max_parallel_races_multiple_backups() {
    // With max_parallel = 3 the hedge fires two backups at once; the
    // fastest of the three in-flight attempts wins.
    let slow = delayed_server(Duration::from_millis(500), json!("0xslow")).await;
    let medium = delayed_server(Duration::from_millis(400), json!("0xmedium")).await;
    let fast = delayed_server(Duration::from_millis(50), json!("0xfast")).await;

    let config = GatewayConfig {
        networks: vec![NetworkConfig {
            id: NETWORK.to_string(),
            failsafe: vec![FailsafeConfig {
                match_method: "*".to_string(),
                match_finality: Vec::new(),
                timeout_ms: Some(5_000),
                retry: Some(RetryConfig::default()),
                hedge: Some(HedgeConfig {
                    delay_ms: 100,
                    min_delay_ms: 100,
                    max_parallel: 3,
                    ..Default::default()
                }),
            }],
            consensus: None,
            selection: SelectionConfig::default(),
        }],
        upstreams: vec![
            upstream("a-slow", &slow.url()),
            upstream("b-medium", &medium.url()),
            upstream("c-fast", &fast.url()),
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();

    let request = JsonRpcRequest::new("eth_chainId", None, json!(1));
    let directives = Directives { skip_cache: true, ..Default::default() };

    let start = std::time::Instant::now();
    let response = gateway.forward(NETWORK, &request, &directives).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(response.serving_upstream.as_deref(), Some("c-fast"));
    // Both backups were fired by the same hedge window.
    assert_eq!(medium.calls_for("eth_chainId"), 1);
    assert!(elapsed < Duration::from_millis(350), "took {elapsed:?}");
}

#[tokio::test]
async fn test_fast_primary_never_hedges() {
    let fast = delayed_server(Duration::from_millis(20), json!("0xfast")).await;
    let backup = delayed_server(Duration::from_millis(20), json!("0xbackup")).await;

    let config = GatewayConfig {
        networks: vec![NetworkConfig {
            id: NETWORK.to_string(),
            failsafe: vec![FailsafeConfig {
                match_method: "*".to_string(),
                match_finality: Vec::new(),
                timeout_ms: Some(5_000),
                retry: Some(RetryConfig::default()),
                hedge: Some(HedgeConfig {
                    delay_ms: 200,
                    min_delay_ms: 200,
                    ..Default::default()
                }),
            }],
            consensus: None,
            selection: SelectionConfig::default(),
        }],
        upstreams: vec![upstream("a-primary", &fast.url()), upstream("b-backup", &backup.url())],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();

    let request = JsonRpcRequest::new("eth_chainId", None, json!(1));
    let directives = Directives { skip_cache: true, ..Default::default() };

    let response = gateway.forward(NETWORK, &request, &directives).await.unwrap();
    assert_eq!(response.serving_upstream.as_deref(), Some("a-primary"));
    assert_eq!(backup.calls_for("eth_chainId"), 0);
}
