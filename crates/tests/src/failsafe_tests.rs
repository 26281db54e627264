//! Failsafe composition: retry handoff, non-retryable short-circuits,
//! and plan deadlines.

use braid_core::{
    config::{GatewayConfig, NetworkConfig, SelectionConfig, UpstreamConfig, UpstreamGroup},
    failsafe::{FailsafeConfig, RetryConfig},
    network::Gateway,
    types::{Directives, JsonRpcRequest},
    upstream::errors::UpstreamError,
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

fn gateway_with(
    upstreams: Vec<UpstreamConfig>,
    failsafe: Vec<FailsafeConfig>,
) -> Gateway {
    Gateway::from_config(GatewayConfig {
        networks: vec![NetworkConfig {
            id: NETWORK.to_string(),
            failsafe,
            consensus: None,
            selection: SelectionConfig::default(),
        }],
        upstreams,
        ..Default::default()
    })
    .unwrap()
}

fn request() -> JsonRpcRequest {
    JsonRpcRequest::new("eth_chainId", None, json!(1))
}

fn no_cache() -> Directives {
    Directives { skip_cache: true, ..Default::default() }
}

#[tokio::test]
async fn test_retry_moves_to_next_candidate() {
    let failing = MockRpcServer::spawn(Arc::new(|method, params| {
        evm_housekeeping(method, params, 100)
            .unwrap_or_else(|| MockReply::error(-32603, "internal error"))
    }))
    .await;
    let healthy = MockRpcServer::healthy(100, json!("0x1")).await;

    let gateway = gateway_with(
        vec![upstream("a-failing", &failing.url()), upstream("b-healthy", &healthy.url())],
        Vec::new(),
    );

    let response = gateway.forward(NETWORK, &request(), &no_cache()).await.unwrap();
    assert_eq!(response.result, Some(json!("0x1")));
    assert_eq!(response.serving_upstream.as_deref(), Some("b-healthy"));
    assert_eq!(failing.calls_for("eth_chainId"), 1);
    assert_eq!(healthy.calls_for("eth_chainId"), 1);
}

#[tokio::test]
async fn test_non_retryable_error_short_circuits() {
    let reverting = MockRpcServer::spawn(Arc::new(|method, params| {
        evm_housekeeping(method, params, 100)
            .unwrap_or_else(|| MockReply::error(-32000, "execution reverted: denied"))
    }))
    .await;
    let healthy = MockRpcServer::healthy(100, json!("0x1")).await;

    let gateway = gateway_with(
        vec![upstream("a-reverting", &reverting.url()), upstream("b-healthy", &healthy.url())],
        Vec::new(),
    );

    let err = gateway.forward(NETWORK, &request(), &no_cache()).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Rpc(-32000, _)));
    // Execution results are final: no second candidate is consulted.
    assert_eq!(healthy.calls_for("eth_chainId"), 0);
}

#[tokio::test]
async fn test_plan_deadline_cancels_slow_dispatch() {
    let slow = MockRpcServer::spawn(Arc::new(|method, params| {
        evm_housekeeping(method, params, 100).unwrap_or_else(|| {
            MockReply::result(json!("0x1")).after(Duration::from_secs(2))
        })
    }))
    .await;

    let gateway = gateway_with(
        vec![upstream("slow", &slow.url())],
        vec![FailsafeConfig {
            match_method: "*".to_string(),
            match_finality: Vec::new(),
            timeout_ms: Some(200),
            retry: Some(RetryConfig::default()),
            hedge: None,
        }],
    );

    let start = std::time::Instant::now();
    let err = gateway.forward(NETWORK, &request(), &no_cache()).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Timeout));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_exhausted_retries_carry_last_error() {
    let failing = MockRpcServer::spawn(Arc::new(|method, params| {
        evm_housekeeping(method, params, 100)
            .unwrap_or_else(|| MockReply::error(-32603, "internal error"))
    }))
    .await;

    let gateway = gateway_with(
        vec![upstream("only", &failing.url())],
        vec![FailsafeConfig {
            match_method: "*".to_string(),
            match_finality: Vec::new(),
            timeout_ms: Some(5_000),
            retry: Some(RetryConfig { max_attempts: 3, delay_ms: 10, ..Default::default() }),
            hedge: None,
        }],
    );

    let err = gateway.forward(NETWORK, &request(), &no_cache()).await.unwrap_err();
    match err {
        UpstreamError::ExhaustedRetries { attempts, last } => {
            assert_eq!(attempts, 1); // a single candidate yields one attempt
            assert!(matches!(*last, UpstreamError::Rpc(-32603, _)));
        }
        other => panic!("expected exhausted retries, got {other}"),
    }
}

#[tokio::test]
async fn test_unsupported_method_skips_to_capable_upstream() {
    let pruned = MockRpcServer::healthy(100, json!("0xpruned")).await;
    let archive = MockRpcServer::healthy(100, json!("0xarchive")).await;

    let mut pruned_config = upstream("a-pruned", &pruned.url());
    pruned_config.allow_methods = vec!["eth_blockNumber".to_string()];

    let gateway = gateway_with(
        vec![pruned_config, upstream("b-archive", &archive.url())],
        Vec::new(),
    );

    // The support matrix removes the pruned upstream before dispatch.
    let response = gateway.forward(NETWORK, &request(), &no_cache()).await.unwrap();
    assert_eq!(response.serving_upstream.as_deref(), Some("b-archive"));
    assert_eq!(pruned.calls_for("eth_chainId"), 0);
}
