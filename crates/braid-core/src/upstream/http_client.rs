//! Shared HTTP client for upstream dispatch.
//!
//! One pooled `reqwest` client serves every upstream, with a semaphore
//! bounding total in-flight requests. Retrying is NOT done here: retry and
//! hedging decisions belong to the failsafe executor, which needs to pick a
//! *different* candidate rather than hammer the same endpoint.

use reqwest::{Client, ClientBuilder};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

use crate::upstream::errors::UpstreamError;

/// Configuration for HTTP client concurrency and pooling.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of concurrent HTTP requests allowed.
    pub concurrent_limit: usize,
    /// Permit acquisition timeout in milliseconds.
    pub permit_timeout_ms: u64,
    /// Whether to advertise and decode gzip on responses.
    pub gzip: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self { concurrent_limit: 1024, permit_timeout_ms: 500, gzip: true }
    }
}

/// HTTP client with semaphore-based concurrency control.
pub struct HttpClient {
    client: Client,
    concurrent_limit: Arc<Semaphore>,
    permit_timeout: Duration,
}

impl HttpClient {
    /// Creates a new HTTP client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_config(&HttpClientConfig::default())
    }

    /// Creates a new HTTP client with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(config: &HttpClientConfig) -> Result<Self, UpstreamError> {
        let mut builder = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .user_agent(concat!("braid/", env!("CARGO_PKG_VERSION")));

        builder = builder.gzip(config.gzip);

        let client = builder.build().map_err(|e| {
            tracing::error!(error = %e, "failed to build http client");
            UpstreamError::ConnectionFailed(format!("http client build failed: {e}"))
        })?;

        Ok(Self {
            client,
            concurrent_limit: Arc::new(Semaphore::new(config.concurrent_limit)),
            permit_timeout: Duration::from_millis(config.permit_timeout_ms),
        })
    }

    /// Sends an HTTP POST with a JSON body and returns the raw response
    /// bytes.
    ///
    /// Cancellation-safe: dropping the returned future aborts the request
    /// promptly (bounded by the underlying TCP close) and releases the
    /// concurrency permit.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::Timeout`] if permit acquisition or the request
    ///   exceeds its deadline
    /// - [`UpstreamError::HttpStatus`] for non-2xx responses
    /// - [`UpstreamError::Transport`] for network failures
    pub async fn post_json(
        &self,
        url: &str,
        body: bytes::Bytes,
        timeout: Duration,
    ) -> Result<bytes::Bytes, UpstreamError> {
        let permit =
            tokio::time::timeout(self.permit_timeout, self.concurrent_limit.acquire()).await;
        let _permit = match permit {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => {
                return Err(UpstreamError::ConnectionFailed("client shutting down".to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    url,
                    available_permits = self.concurrent_limit.available_permits(),
                    "http client concurrency limit saturated"
                );
                return Err(UpstreamError::Timeout);
            }
        };

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(UpstreamError::HttpStatus(status.as_u16(), snippet));
        }

        response.bytes().await.map_err(UpstreamError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_json_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
            .create_async()
            .await;

        let client = HttpClient::new().unwrap();
        let body = bytes::Bytes::from_static(b"{}");
        let result = client.post_json(&server.url(), body, Duration::from_secs(5)).await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_json_http_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/").with_status(503).with_body("overloaded").create_async().await;

        let client = HttpClient::new().unwrap();
        let body = bytes::Bytes::from_static(b"{}");
        let err = client.post_json(&server.url(), body, Duration::from_secs(5)).await.unwrap_err();

        match err {
            UpstreamError::HttpStatus(503, text) => assert_eq!(text, "overloaded"),
            other => panic!("expected http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_post_json_connection_refused() {
        let client = HttpClient::new().unwrap();
        let body = bytes::Bytes::from_static(b"{}");
        let err = client
            .post_json("http://127.0.0.1:1", body, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
