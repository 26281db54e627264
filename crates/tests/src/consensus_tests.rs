//! Consensus rounds against mock upstreams: agreement, dispute
//! resolution, and misbehavior penalties.

use braid_core::{
    config::{GatewayConfig, NetworkConfig, SelectionConfig, UpstreamConfig, UpstreamGroup},
    consensus::{ConsensusConfig, DisputeBehavior, MisbehaviorConfig},
    network::Gateway,
    types::{Directives, JsonRpcRequest},
    upstream::{errors::UpstreamError, MetricsKey},
};
use serde_json::json;
use std::sync::Arc;

use crate::mock_infrastructure::{evm_housekeeping, MockReply, MockRpcServer};

const NETWORK: &str = "evm:1";
const METHOD: &str = "eth_call";

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

/// A server answering the consensus method with `answer` and housekeeping
/// with `head`.
async fn voting_server(head: u64, answer: serde_json::Value, delay_ms: u64) -> MockRpcServer {
    MockRpcServer::spawn(Arc::new(move |method, params| {
        evm_housekeeping(method, params, head).unwrap_or_else(|| {
            MockReply::result(answer.clone()).after(std::time::Duration::from_millis(delay_ms))
        })
    }))
    .await
}

fn consensus_network(consensus: ConsensusConfig) -> NetworkConfig {
    NetworkConfig {
        id: NETWORK.to_string(),
        failsafe: Vec::new(),
        consensus: Some(consensus),
        selection: SelectionConfig::default(),
    }
}

fn call_request() -> JsonRpcRequest {
    JsonRpcRequest::new(METHOD, Some(json!([{"to": "0xabc"}, "0x64"])), json!(1))
}

#[tokio::test]
async fn test_agreement_reached_and_disputer_penalized() {
    // u1 and u2 agree on 0xabc; u3 answers 0xdef first and loses.
    let u1 = voting_server(100, json!("0xabc"), 30).await;
    let u2 = voting_server(100, json!("0xabc"), 30).await;
    let u3 = voting_server(100, json!("0xdef"), 0).await;

    let config = GatewayConfig {
        networks: vec![consensus_network(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            methods: vec![METHOD.to_string()],
            ..Default::default()
        })],
        upstreams: vec![
            upstream("u1", &u1.url()),
            upstream("u2", &u2.url()),
            upstream("u3", &u3.url()),
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    let response = gateway.forward(NETWORK, &call_request(), &directives).await.unwrap();
    assert_eq!(response.result, Some(json!("0xabc")));

    // The disagreeing upstream accrued a scoring penalty.
    let key = MetricsKey {
        upstream: Arc::from("u3"),
        network: Arc::from(NETWORK),
        method: Arc::from(METHOD),
    };
    let snapshot = gateway.metrics().snapshot(&key, 0, 0);
    assert!(snapshot.error_rate > 0.0, "disputer must be penalized");
}

#[tokio::test]
async fn test_dispute_returns_error_by_default() {
    let u1 = voting_server(100, json!("0xaaa"), 0).await;
    let u2 = voting_server(100, json!("0xbbb"), 0).await;
    let u3 = voting_server(100, json!("0xccc"), 0).await;

    let config = GatewayConfig {
        networks: vec![consensus_network(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            methods: vec![METHOD.to_string()],
            dispute_behavior: DisputeBehavior::ReturnError,
            ..Default::default()
        })],
        upstreams: vec![
            upstream("u1", &u1.url()),
            upstream("u2", &u2.url()),
            upstream("u3", &u3.url()),
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    let err = gateway.forward(NETWORK, &call_request(), &directives).await.unwrap_err();
    assert!(matches!(err, UpstreamError::ConsensusDispute(_)));
}

#[tokio::test]
async fn test_dispute_resolved_by_block_head_leader() {
    // Three distinct answers; u1 holds the highest block and wins.
    let u1 = voting_server(100, json!("0xabc"), 0).await;
    let u2 = voting_server(99, json!("0xdef"), 0).await;
    let u3 = voting_server(99, json!("0x123"), 0).await;

    let config = GatewayConfig {
        networks: vec![consensus_network(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            methods: vec![METHOD.to_string()],
            dispute_behavior: DisputeBehavior::PreferBlockHeadLeader,
            ..Default::default()
        })],
        upstreams: vec![
            upstream("u1", &u1.url()),
            upstream("u2", &u2.url()),
            upstream("u3", &u3.url()),
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();

    // Publish heads so the leader is known before the round runs.
    gateway.refresh_upstream_state().await;

    let directives = Directives { skip_cache: true, ..Default::default() };
    let response = gateway.forward(NETWORK, &call_request(), &directives).await.unwrap();
    assert_eq!(response.result, Some(json!("0xabc")));
}

#[tokio::test]
async fn test_low_participants_returns_error() {
    let only = voting_server(100, json!("0xabc"), 0).await;

    let config = GatewayConfig {
        networks: vec![consensus_network(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            methods: vec![METHOD.to_string()],
            low_participants_behavior: DisputeBehavior::ReturnError,
            ..Default::default()
        })],
        upstreams: vec![upstream("only", &only.url())],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    let err = gateway.forward(NETWORK, &call_request(), &directives).await.unwrap_err();
    assert!(matches!(err, UpstreamError::ConsensusLowParticipants(_)));
}

#[tokio::test]
async fn test_repeated_disputes_cordon_upstream() {
    let u1 = voting_server(100, json!("0xabc"), 30).await;
    let u2 = voting_server(100, json!("0xabc"), 30).await;
    let u3 = voting_server(100, json!("0xdef"), 0).await;

    let config = GatewayConfig {
        networks: vec![consensus_network(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            methods: vec![METHOD.to_string()],
            // After u3 is cordoned the round runs with two participants.
            low_participants_behavior: DisputeBehavior::AcceptMostCommonValidResult,
            punish_misbehavior: Some(MisbehaviorConfig {
                dispute_threshold: 2,
                dispute_window_secs: 300,
                sit_out_penalty_secs: 600,
            }),
            ..Default::default()
        })],
        upstreams: vec![
            upstream("u1", &u1.url()),
            upstream("u2", &u2.url()),
            upstream("u3", &u3.url()),
        ],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    // Two disputed rounds push u3 over the threshold.
    gateway.forward(NETWORK, &call_request(), &directives).await.unwrap();
    gateway.forward(NETWORK, &call_request(), &directives).await.unwrap();

    let before = u3.calls_for(METHOD);

    // Cordoned: the next round must not include u3.
    gateway.forward(NETWORK, &call_request(), &directives).await.unwrap();
    assert_eq!(u3.calls_for(METHOD), before);
}

#[tokio::test]
async fn test_methods_outside_consensus_scope_use_single_dispatch() {
    let u1 = voting_server(100, json!("0xabc"), 0).await;
    let u2 = voting_server(100, json!("0xdef"), 0).await;

    let config = GatewayConfig {
        networks: vec![consensus_network(ConsensusConfig {
            required_participants: 2,
            agreement_threshold: 2,
            methods: vec!["eth_getBlockByNumber".to_string()],
            ..Default::default()
        })],
        upstreams: vec![upstream("u1", &u1.url()), upstream("u2", &u2.url())],
        ..Default::default()
    };
    let gateway = Gateway::from_config(config).unwrap();
    let directives = Directives { skip_cache: true, ..Default::default() };

    // eth_call is not in the consensus method set: exactly one upstream
    // sees it.
    gateway.forward(NETWORK, &call_request(), &directives).await.unwrap();
    assert_eq!(u1.calls_for(METHOD) + u2.calls_for(METHOD), 1);
}
