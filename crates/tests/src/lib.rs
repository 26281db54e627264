//! Integration tests for the Braid gateway core.
//!
//! Test modules:
//!
//! - `gateway_tests`: end-to-end `forward` scenarios — caching,
//!   single-flight deduplication, rate-limit budgets, fallback promotion
//! - `hedging_tests`: hedged dispatch racing a slow primary
//! - `consensus_tests`: agreement, dispute resolution, misbehavior
//!   penalties
//! - `failsafe_tests`: retry composition and error surfacing
//! - `mock_infrastructure`: a minimal JSON-RPC upstream server with
//!   per-method canned responses and injectable latency
//!
//! Run with:
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod consensus_tests;

#[cfg(test)]
mod failsafe_tests;

#[cfg(test)]
mod gateway_tests;

#[cfg(test)]
mod hedging_tests;

/// Mock infrastructure for testing
pub mod mock_infrastructure;
