//! Core type definitions: the JSON-RPC envelope, request directives, and
//! finality classification.
//!
//! # Performance Notes
//!
//! - `jsonrpc`: `Cow<'static, str>` avoids allocating the version string.
//! - `id`: `Arc<serde_json::Value>` makes echoing the request id into
//!   responses a reference-count bump instead of a deep clone.
//! - Gateway-internal metadata (`serving_upstream`, `finality`) is carried
//!   on the response struct but never serialized, keeping the wire format
//!   plain JSON-RPC 2.0.

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, sync::Arc};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version - zero allocation for static usage.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Durability classification of a response.
///
/// Drives cache policy matching and TTL selection: `Finalized` data is safe
/// to keep indefinitely, `Unfinalized` data may reorg away, `Realtime` data
/// changes every block, and `Unknown` data cannot be classified (the caller
/// identified the object by hash and accepts out-of-band invalidation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    Finalized,
    Unfinalized,
    Realtime,
    Unknown,
}

impl std::fmt::Display for Finality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finality::Finalized => write!(f, "finalized"),
            Finality::Unfinalized => write!(f, "unfinalized"),
            Finality::Realtime => write!(f, "realtime"),
            Finality::Unknown => write!(f, "unknown"),
        }
    }
}

/// Request-scoped behavior overrides.
///
/// Parsed from transport headers by the server layer and passed through
/// unchanged. The core only ever reads these flags.
#[derive(Debug, Clone, Default)]
pub struct Directives {
    /// Bypass the cache entirely (no read, no write).
    pub skip_cache: bool,
    /// Retry empty results on the next candidate before accepting them.
    pub retry_empty: bool,
    /// Restrict selection to upstreams whose id matches this glob.
    pub require_upstreams: Option<String>,
}

impl Directives {
    /// Returns `true` if the given upstream id passes the
    /// `require_upstreams` restriction (vacuously true when unset).
    #[must_use]
    pub fn allows_upstream(&self, upstream_id: &str) -> bool {
        self.require_upstreams
            .as_deref()
            .is_none_or(|pattern| crate::utils::glob::matches(pattern, upstream_id))
    }
}

/// JSON-RPC 2.0 request structure.
///
/// # Example
///
/// ```
/// use braid_core::types::JsonRpcRequest;
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new("eth_blockNumber", None, json!(1));
/// assert_eq!(request.method, "eth_blockNumber");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: Arc<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Creates a new JSON-RPC request with zero allocation for the version string.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }

    /// Returns the positional parameter at `index`, if present.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&serde_json::Value> {
        self.params.as_ref().and_then(|p| p.as_array()).and_then(|a| a.get(index))
    }
}

/// JSON-RPC 2.0 response structure.
///
/// Contains either a `result` (success) or an `error` (failure), never both.
/// `serving_upstream`, `upstream_block` and `finality` are gateway-internal
/// metadata attached after dispatch; they are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Arc<serde_json::Value>,
    /// Id of the upstream that produced this response.
    #[serde(skip)]
    pub serving_upstream: Option<Arc<str>>,
    /// Latest block the serving upstream had observed at dispatch time.
    #[serde(skip)]
    pub upstream_block: Option<u64>,
    /// Finality classification computed at cache-write time.
    #[serde(skip)]
    pub finality: Option<Finality>,
}

impl JsonRpcResponse {
    /// Creates a successful JSON-RPC response.
    #[must_use]
    pub fn success(result: serde_json::Value, id: Arc<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: Some(result),
            error: None,
            id,
            serving_upstream: None,
            upstream_block: None,
            finality: None,
        }
    }

    /// Creates an error JSON-RPC response.
    #[must_use]
    pub fn error(code: i32, message: String, id: Arc<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
            serving_upstream: None,
            upstream_block: None,
            finality: None,
        }
    }

    /// Returns `true` if the result is present and neither `null` nor an
    /// empty array/object.
    #[must_use]
    pub fn has_meaningful_result(&self) -> bool {
        match &self.result {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }
}

/// JSON-RPC 2.0 error object.
///
/// Standard codes follow the JSON-RPC 2.0 convention (`-32700` parse error,
/// `-32600..-32602` client errors, `-32601` method not found, `-32603`
/// internal error). Gateway-originated errors use a private namespace; see
/// [`crate::upstream::errors`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
