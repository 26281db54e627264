//! Per-upstream state polling.
//!
//! A background task per upstream tracks the latest and finalized block
//! numbers plus last success/error, publishing them atomically so selectors
//! and the cache read a consistent snapshot without locking.
//!
//! Finalized tracking prefers the `finalized` block tag; upstreams that
//! reject it fall back to `latest - fallback_finality_depth` as a
//! conservative estimate, and the tag is not retried once it proves
//! unsupported.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    types::JsonRpcRequest,
    upstream::{endpoint::Upstream, errors::UpstreamError, metrics::MetricsTracker},
    utils::hex_num,
};

/// Atomically published poller state.
///
/// Readers obtain the whole snapshot through one `ArcSwap` load; there are
/// no torn reads.
#[derive(Debug, Clone, Default)]
pub struct ChainSnapshot {
    pub latest: u64,
    pub finalized: u64,
    /// Unix timestamp in ms of the last successful poll.
    pub last_success_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Spawns the polling loop for one upstream.
///
/// Poll failures never fail requests; they only leave `last_error` in the
/// snapshot and stall the published heads, which degrades the upstream's
/// score through block-head lag.
pub fn spawn(
    upstream: Arc<Upstream>,
    metrics: Arc<MetricsTracker>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(upstream.config().poll_interval_secs.max(1));
    tokio::spawn(async move {
        let finalized_tag_unsupported = AtomicBool::new(false);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            poll_once(&upstream, &metrics, &finalized_tag_unsupported).await;
        }
    })
}

/// Runs a single poll cycle. Exposed for tests and warm-up.
pub async fn poll_once(
    upstream: &Arc<Upstream>,
    metrics: &Arc<MetricsTracker>,
    finalized_tag_unsupported: &AtomicBool,
) {
    match fetch_latest(upstream).await {
        Ok(latest) => {
            let finalized = if finalized_tag_unsupported.load(Ordering::Relaxed) {
                latest.saturating_sub(upstream.config().fallback_finality_depth)
            } else {
                match fetch_finalized(upstream).await {
                    Ok(finalized) => finalized,
                    Err(e) => {
                        if matches!(&e, UpstreamError::Rpc(code, _) if *code == -32601)
                            || matches!(&e, UpstreamError::UnsupportedMethod(_))
                        {
                            debug!(
                                upstream = %upstream.id(),
                                "finalized tag unsupported, using fallback depth"
                            );
                            finalized_tag_unsupported.store(true, Ordering::Relaxed);
                        }
                        latest.saturating_sub(upstream.config().fallback_finality_depth)
                    }
                }
            };

            upstream.publish_snapshot(latest, finalized, None);
            for network in &upstream.config().networks {
                let network: Arc<str> = Arc::from(network.as_str());
                metrics.observe_head(&network, latest, finalized);
            }

            debug!(
                upstream = %upstream.id(),
                latest,
                finalized,
                "poll cycle complete"
            );
        }
        Err(e) => {
            warn!(upstream = %upstream.id(), error = %e, "state poll failed");
            upstream.publish_poll_error(e.to_string());
        }
    }
}

async fn fetch_latest(upstream: &Arc<Upstream>) -> Result<u64, UpstreamError> {
    let request = JsonRpcRequest::new("eth_blockNumber", None, serde_json::Value::from(1));
    let response = upstream.dispatch_raw(&request).await?;
    response
        .result
        .as_ref()
        .and_then(|r| r.as_str())
        .and_then(hex_num::parse_quantity)
        .ok_or_else(|| UpstreamError::InvalidResponse("malformed eth_blockNumber result".into()))
}

async fn fetch_finalized(upstream: &Arc<Upstream>) -> Result<u64, UpstreamError> {
    let request = JsonRpcRequest::new(
        "eth_getBlockByNumber",
        Some(serde_json::json!(["finalized", false])),
        serde_json::Value::from(2),
    );
    let response = upstream.dispatch_raw(&request).await?;
    response
        .result
        .as_ref()
        .and_then(|r| r.get("number"))
        .and_then(|n| n.as_str())
        .and_then(hex_num::parse_quantity)
        .ok_or_else(|| UpstreamError::InvalidResponse("malformed finalized block result".into()))
}
