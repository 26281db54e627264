//! Pluggable key-value backends for the response cache.
//!
//! The core sees only the [`KvStore`] capability; concrete drivers
//! (Redis, Postgres, DynamoDB) live behind the server layer. The bounded
//! in-memory LRU connector ships here and is the default.

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use thiserror::Error;

/// Default bound for the memory connector.
pub const DEFAULT_MEMORY_MAX_ITEMS: usize = 100_000;

/// Errors surfaced by cache backends.
///
/// These never fail a request; the cache layer degrades to miss semantics
/// and counts the failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend operation failed: {0}")]
    Operation(String),
}

/// Key-value capability consumed by the cache layer.
///
/// Implementations must be safe for concurrent use; the core does not
/// serialize calls.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Connector declaration in the normalized configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector id referenced by cache policies (default: `memory`).
    #[serde(default = "default_connector_id")]
    pub id: String,

    /// Maximum items held by the memory driver (default: 100k).
    #[serde(default = "default_memory_max_items")]
    pub max_items: usize,
}

fn default_connector_id() -> String {
    "memory".to_string()
}
fn default_memory_max_items() -> usize {
    DEFAULT_MEMORY_MAX_ITEMS
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self { id: default_connector_id(), max_items: default_memory_max_items() }
    }
}

struct MemoryEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// Bounded in-memory LRU connector.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, MemoryEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new(max_items: usize) -> Self {
        let cap = NonZeroUsize::new(max_items.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns `(hits, misses)` counters.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    /// Current entry count (expired entries included until touched).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_MAX_ITEMS)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| Instant::now() >= at),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if expired {
            entries.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries.lock().put(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().pop(key);
        Ok(())
    }
}
