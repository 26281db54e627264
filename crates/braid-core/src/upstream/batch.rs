//! Outbound JSON-RPC batch coalescing.
//!
//! When an upstream supports batching, individual requests are funneled
//! through a single coalescer task per upstream. The task collects requests
//! until `batch_max_size` or the `batch_max_wait` window elapses, dispatches
//! one HTTP call, and routes each response back to its suspended caller.
//! Batching is transparent: callers await exactly as for single dispatch.

use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    types::{JsonRpcRequest, JsonRpcResponse},
    upstream::{errors::UpstreamError, http_client::HttpClient},
};

type BatchResult = Result<JsonRpcResponse, UpstreamError>;

struct BatchItem {
    request: JsonRpcRequest,
    respond: oneshot::Sender<BatchResult>,
}

/// Handle used by the endpoint to enqueue requests for coalescing.
pub struct BatchCoalescer {
    tx: mpsc::Sender<BatchItem>,
}

impl BatchCoalescer {
    /// Spawns the coalescer task for one upstream endpoint.
    pub fn spawn(
        http_client: Arc<HttpClient>,
        url: String,
        max_size: usize,
        max_wait: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_coalescer(http_client, url, max_size.max(1), max_wait, request_timeout, rx));
        Self { tx }
    }

    /// Enqueues a request and suspends until its slot is dispatched.
    ///
    /// # Errors
    ///
    /// Returns the per-entry upstream error, or `ConnectionFailed` if the
    /// coalescer task has shut down.
    pub async fn dispatch(&self, request: JsonRpcRequest) -> BatchResult {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(BatchItem { request, respond })
            .await
            .map_err(|_| UpstreamError::ConnectionFailed("batch coalescer stopped".to_string()))?;
        rx.await
            .map_err(|_| UpstreamError::ConnectionFailed("batch coalescer dropped request".to_string()))?
    }
}

async fn run_coalescer(
    http_client: Arc<HttpClient>,
    url: String,
    max_size: usize,
    max_wait: Duration,
    request_timeout: Duration,
    mut rx: mpsc::Receiver<BatchItem>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];

        let window = tokio::time::sleep(max_wait);
        tokio::pin!(window);

        while batch.len() < max_size {
            tokio::select! {
                () = &mut window => break,
                item = rx.recv() => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
            }
        }

        debug!(url = %url, size = batch.len(), "dispatching coalesced batch");
        dispatch_batch(&http_client, &url, batch, request_timeout).await;
    }
}

/// Rebuilds an error for each waiter; `UpstreamError` is not `Clone`
/// because it can wrap transport errors.
fn broadcast_error(source: &UpstreamError) -> UpstreamError {
    match source {
        UpstreamError::Timeout => UpstreamError::Timeout,
        UpstreamError::HttpStatus(status, text) => {
            UpstreamError::HttpStatus(*status, text.clone())
        }
        other => UpstreamError::ConnectionFailed(other.to_string()),
    }
}

async fn dispatch_batch(
    http_client: &HttpClient,
    url: &str,
    batch: Vec<BatchItem>,
    request_timeout: Duration,
) {
    // Outbound ids are rewritten to the batch index so responses can be
    // routed back regardless of what ids the callers used.
    let outbound: Vec<JsonRpcRequest> = batch
        .iter()
        .enumerate()
        .map(|(i, item)| JsonRpcRequest {
            id: Arc::new(serde_json::Value::from(i)),
            ..item.request.clone()
        })
        .collect();

    let body = match serde_json::to_vec(&outbound) {
        Ok(body) => body,
        Err(e) => {
            let err = UpstreamError::InvalidRequest(format!("batch serialization failed: {e}"));
            for item in batch {
                let _ = item.respond.send(Err(broadcast_error(&err)));
            }
            return;
        }
    };

    let response_bytes = match http_client
        .post_json(url, bytes::Bytes::from(body), request_timeout)
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(url = %url, error = %e, "batch dispatch failed");
            for item in batch {
                let _ = item.respond.send(Err(broadcast_error(&e)));
            }
            return;
        }
    };

    let responses: Vec<JsonRpcResponse> = match serde_json::from_slice(&response_bytes) {
        Ok(responses) => responses,
        Err(e) => {
            let err = UpstreamError::InvalidResponse(format!("invalid batch response: {e}"));
            for item in batch {
                let _ = item.respond.send(Err(broadcast_error(&err)));
            }
            return;
        }
    };

    let mut slots: Vec<Option<JsonRpcResponse>> = vec![None; batch.len()];
    for response in responses {
        if let Some(index) = response.id.as_u64() {
            if let Some(slot) = slots.get_mut(usize::try_from(index).unwrap_or(usize::MAX)) {
                *slot = Some(response);
            }
        }
    }

    for (item, slot) in batch.into_iter().zip(slots) {
        let result = match slot {
            Some(mut response) => {
                // Restore the caller's original id.
                response.id = Arc::clone(&item.request.id);
                Ok(response)
            }
            None => Err(UpstreamError::InvalidResponse(
                "batch response missing entry".to_string(),
            )),
        };
        let _ = item.respond.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_batch_coalesces_and_routes_responses() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(
                json!([
                    {"jsonrpc": "2.0", "id": 0, "result": "0x0"},
                    {"jsonrpc": "2.0", "id": 1, "result": "0x1"},
                ])
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let coalescer = BatchCoalescer::spawn(
            Arc::new(HttpClient::new().unwrap()),
            server.url(),
            10,
            Duration::from_millis(50),
            Duration::from_secs(5),
        );

        let a = coalescer.dispatch(JsonRpcRequest::new("eth_chainId", None, json!("req-a")));
        let b = coalescer.dispatch(JsonRpcRequest::new("eth_blockNumber", None, json!("req-b")));
        let (a, b) = tokio::join!(a, b);

        let a = a.unwrap();
        let b = b.unwrap();
        // Original caller ids are restored after routing by batch index.
        assert_eq!(*a.id, json!("req-a"));
        assert_eq!(a.result, Some(json!("0x0")));
        assert_eq!(*b.id, json!("req-b"));
        assert_eq!(b.result, Some(json!("0x1")));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_batch_error_reaches_every_waiter() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/").with_status(503).with_body("down").create_async().await;

        let coalescer = BatchCoalescer::spawn(
            Arc::new(HttpClient::new().unwrap()),
            server.url(),
            10,
            Duration::from_millis(20),
            Duration::from_secs(5),
        );

        let a = coalescer.dispatch(JsonRpcRequest::new("eth_chainId", None, json!(1)));
        let b = coalescer.dispatch(JsonRpcRequest::new("eth_chainId", None, json!(2)));
        let (a, b) = tokio::join!(a, b);

        assert!(matches!(a.unwrap_err(), UpstreamError::HttpStatus(503, _)));
        assert!(matches!(b.unwrap_err(), UpstreamError::HttpStatus(503, _)));
    }

    #[tokio::test]
    async fn test_missing_entry_is_per_slot_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(json!([{"jsonrpc": "2.0", "id": 0, "result": "0x0"}]).to_string())
            .create_async()
            .await;

        let coalescer = BatchCoalescer::spawn(
            Arc::new(HttpClient::new().unwrap()),
            server.url(),
            10,
            Duration::from_millis(20),
            Duration::from_secs(5),
        );

        let a = coalescer.dispatch(JsonRpcRequest::new("eth_chainId", None, json!(1)));
        let b = coalescer.dispatch(JsonRpcRequest::new("eth_chainId", None, json!(2)));
        let (a, b) = tokio::join!(a, b);

        assert!(a.is_ok());
        assert!(matches!(b.unwrap_err(), UpstreamError::InvalidResponse(_)));
    }
}
