//! # Braid Core
//!
//! Core library for the Braid fault-tolerant JSON-RPC gateway.
//!
//! Braid sits between blockchain clients and a pool of upstream RPC
//! providers. Every inbound request flows through a single entry point,
//! [`network::Network::forward`], which composes the crate's subsystems:
//!
//! - **[`cache`]**: Finality-aware response caching with first-match policy
//!   selection, single-flight deduplication of concurrent misses, and a
//!   pluggable key-value backend (bounded LRU memory connector included).
//!
//! - **[`upstream`]**: Per-provider endpoints with circuit breakers, named
//!   rate-limit budgets with auto-tuning, batch coalescing, state polling
//!   (latest/finalized block tracking), sliding-window metrics, and
//!   score-based candidate selection.
//!
//! - **[`failsafe`]**: Per-(method, finality) execution plans composing
//!   timeout, retry with backoff, and latency-quantile hedging.
//!
//! - **[`consensus`]**: Parallel fan-out with agreement thresholding,
//!   dispute resolution strategies, and misbehavior cordoning.
//!
//! - **[`catalog`]**: The method catalog mapping each RPC method to its
//!   block-reference paths and finality class.
//!
//! ## Request Flow
//!
//! ```text
//! forward(network, request, directives)
//!       │
//!       ▼
//! ┌──────────────┐
//! │ Fingerprint  │  canonical hash of (network, method, params)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │ Cache lookup │ ─── hit ──► cached response
//! └──────┬───────┘
//!        │ miss (single-flight leader)
//!        ▼
//! ┌──────────────┐
//! │   Selector   │  policy-filtered, score-ranked candidates
//! └──────┬───────┘
//!        ▼
//! ┌──────────────────────────────────────────┐
//! │ Failsafe plan                            │
//! │ timeout → retry → hedge → breaker → ...  │
//! │            └── consensus fan-out (opt.)  │
//! └──────┬───────────────────────────────────┘
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ Upstream(s)  │ ──► │ Cache write  │ ──► response
//! └──────────────┘     └──────────────┘
//! ```
//!
//! Ownership follows the configuration graph: a [`network::Gateway`] owns
//! the flat upstream registry, the budget registry, and one
//! [`network::Network`] per chain; each network owns its selector,
//! failsafe executor, and cache handle; each upstream owns its breaker,
//! coalescer, and state poller.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod consensus;
pub mod failsafe;
pub mod fingerprint;
pub mod network;
pub mod types;
pub mod upstream;
pub mod utils;
