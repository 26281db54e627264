//! Error taxonomy for upstream dispatch and the gateway pipeline.
//!
//! Classification drives three independent decisions:
//! - **retry**: transient kinds are consumed inside the retry loop;
//! - **penalty**: only upstream-fault kinds degrade the health score;
//! - **breaker**: only systemic upstream-fault kinds trip the circuit.

use thiserror::Error;

use crate::types::JsonRpcResponse;

/// Gateway-originated JSON-RPC error codes (private `-328xx` namespace).
pub mod codes {
    pub const CONSENSUS_DISPUTE: i32 = -32801;
    pub const CONSENSUS_LOW_PARTICIPANTS: i32 = -32802;
    pub const ALL_UPSTREAMS_FAILED: i32 = -32803;
    pub const RATE_LIMIT_EXCEEDED: i32 = -32804;
    pub const UNSUPPORTED_METHOD: i32 = -32805;
    pub const CIRCUIT_OPEN: i32 = -32806;
    pub const TIMEOUT: i32 = -32807;
}

/// Classification of JSON-RPC errors returned by upstreams.
///
/// Client errors and execution errors are the caller's problem and must not
/// penalize the upstream; provider errors and parse errors are the
/// upstream's fault; rate limits are transient and should move the request
/// to a different upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorCategory {
    ClientError,
    ProviderError,
    RateLimit,
    ParseError,
    /// Reverts, out-of-gas, nonce issues: the transaction's problem, not
    /// the provider's. These still participate in consensus comparison.
    ExecutionError,
}

impl RpcErrorCategory {
    /// Classifies a JSON-RPC error code and message.
    ///
    /// The `-32000..=-32099` server range is ambiguous: providers report
    /// both infrastructure faults and execution results there, so the
    /// message is inspected to tell them apart.
    #[must_use]
    pub fn from_code_and_message(code: i32, message: &str) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32602..=-32600 => Self::ClientError,
            -32005 => Self::RateLimit,
            -32099..=-32000 => {
                let lower = message.to_lowercase();
                if lower.contains("execution reverted")
                    || lower.contains("revert")
                    || lower.contains("out of gas")
                    || lower.contains("insufficient funds")
                    || lower.contains("nonce too low")
                    || lower.contains("gas too low")
                {
                    Self::ExecutionError
                } else {
                    Self::ProviderError
                }
            }
            _ => Self::ProviderError,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderError)
    }

    #[must_use]
    pub fn should_penalize_upstream(&self) -> bool {
        matches!(self, Self::ProviderError | Self::ParseError)
    }
}

/// Errors produced while dispatching to upstreams or composing the
/// failsafe pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded the plan's deadline.
    #[error("request timeout")]
    Timeout,

    /// Network-level error from the HTTP client.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Failed to reach the upstream endpoint.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx HTTP status. `429` is treated as throttling.
    #[error("http {0}: {1}")]
    HttpStatus(u16, String),

    /// JSON-RPC error object returned by the upstream.
    #[error("rpc error {0}: {1}")]
    Rpc(i32, String),

    /// A gateway-side rate-limit budget rejected the request.
    #[error("rate limit budget '{budget}' exhausted for method {method}")]
    RateLimitExceeded { budget: String, method: String },

    /// The upstream does not serve this method.
    #[error("method {0} not supported by upstream")]
    UnsupportedMethod(String),

    /// Circuit breaker is open for this upstream.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// Response body could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Request could not be serialized or failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The selection policy excluded every upstream.
    #[error("selection policy excluded all upstreams")]
    PolicyExcluded,

    /// Every candidate failed; carries the last observed error and the
    /// number of attempts made.
    #[error("all upstreams failed after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<UpstreamError> },

    /// Consensus round completed without reaching the agreement threshold.
    #[error("consensus dispute: {0}")]
    ConsensusDispute(String),

    /// Fewer healthy participants than the consensus round requires.
    #[error("consensus low participants: {0}")]
    ConsensusLowParticipants(String),

    /// No healthy upstream was available to try.
    #[error("no healthy upstreams available")]
    NoHealthyUpstreams,

    /// Configuration rejected during normalization.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl UpstreamError {
    /// Returns the RPC error category if this is an upstream RPC error.
    #[must_use]
    pub fn rpc_category(&self) -> Option<RpcErrorCategory> {
        match self {
            Self::Rpc(code, message) => {
                Some(RpcErrorCategory::from_code_and_message(*code, message))
            }
            _ => None,
        }
    }

    /// Returns `true` if the request should be retried on another candidate.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout
            | Self::Transport(_)
            | Self::ConnectionFailed(_)
            | Self::CircuitOpen
            | Self::NoHealthyUpstreams => true,
            Self::HttpStatus(status, _) => (500..=599).contains(status) || *status == 429,
            Self::Rpc(_, _) => self.rpc_category().is_some_and(|c| c.is_transient()),
            _ => false,
        }
    }

    /// Returns `true` if this outcome was a throttle (gateway- or
    /// upstream-side) rather than a hard failure.
    #[must_use]
    pub fn is_throttle(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. } => true,
            Self::HttpStatus(status, _) => *status == 429,
            Self::Rpc(_, _) => self.rpc_category() == Some(RpcErrorCategory::RateLimit),
            _ => false,
        }
    }

    /// Returns `true` if this error should degrade the upstream's score.
    #[must_use]
    pub fn should_penalize_upstream(&self) -> bool {
        match self {
            Self::Timeout
            | Self::Transport(_)
            | Self::ConnectionFailed(_)
            | Self::InvalidResponse(_) => true,
            Self::HttpStatus(status, _) => (500..=599).contains(status),
            Self::Rpc(_, _) => self.rpc_category().is_some_and(|c| c.should_penalize_upstream()),
            _ => false,
        }
    }

    /// Returns `true` if this error should count toward opening the
    /// serving upstream's circuit breaker.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        // Throttles are excluded: a rate-limited upstream is healthy, just
        // busy, and opening the breaker would amplify the overload.
        self.should_penalize_upstream() && !self.is_throttle()
    }

    /// Maps this error to a client-facing JSON-RPC error response.
    ///
    /// Cause chains stay in logs; the client sees a machine-readable code
    /// and a single-line message.
    #[must_use]
    pub fn to_response(&self, id: std::sync::Arc<serde_json::Value>) -> JsonRpcResponse {
        let (code, message) = match self {
            Self::Rpc(code, message) => (*code, message.clone()),
            Self::Timeout => (codes::TIMEOUT, "request timed out".to_string()),
            Self::RateLimitExceeded { .. } => {
                (codes::RATE_LIMIT_EXCEEDED, "rate limit exceeded".to_string())
            }
            Self::UnsupportedMethod(method) => {
                (codes::UNSUPPORTED_METHOD, format!("method {method} not supported"))
            }
            Self::CircuitOpen => (codes::CIRCUIT_OPEN, "upstream circuit open".to_string()),
            Self::ConsensusDispute(_) => {
                (codes::CONSENSUS_DISPUTE, "consensus dispute".to_string())
            }
            Self::ConsensusLowParticipants(_) => (
                codes::CONSENSUS_LOW_PARTICIPANTS,
                "insufficient consensus participants".to_string(),
            ),
            Self::ExhaustedRetries { .. } | Self::NoHealthyUpstreams | Self::PolicyExcluded => {
                (codes::ALL_UPSTREAMS_FAILED, "all upstreams failed".to_string())
            }
            Self::InvalidRequest(msg) => (-32600, msg.clone()),
            _ => (-32603, "internal gateway error".to_string()),
        };

        JsonRpcResponse::error(code, message, id)
    }
}
