//! Single-flight deduplication of concurrent cache misses.
//!
//! Concurrent misses on the same fingerprint block until the first
//! in-flight request completes and then share its outcome. The guard is
//! RAII: a leader that is cancelled (dropped without publishing) wakes its
//! followers, and the first of them retries as the new leader, so a
//! cancelled request never strands waiters.
//!
//! Deduplication spans the whole network: the map key is the request
//! fingerprint, which already encodes the network id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::types::JsonRpcResponse;

type Shared = Option<JsonRpcResponse>;

/// Outcome of [`SingleFlight::begin`].
pub enum Flight {
    /// This caller leads: it must perform the fetch and publish through
    /// the guard.
    Leader(FlightGuard),
    /// Another caller led and published this response envelope. The `id`
    /// still reflects the leader's request and must be re-stamped.
    Shared(JsonRpcResponse),
}

/// RAII guard held by the single-flight leader.
pub struct FlightGuard {
    key: u64,
    inflight: Arc<Mutex<HashMap<u64, watch::Receiver<Shared>>>>,
    tx: watch::Sender<Shared>,
    published: bool,
}

impl FlightGuard {
    /// Publishes the final response envelope to all followers.
    pub fn publish(mut self, response: &JsonRpcResponse) {
        self.published = true;
        self.remove_entry();
        let _ = self.tx.send(Some(response.clone()));
    }

    fn remove_entry(&self) {
        self.inflight.lock().remove(&self.key);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.published {
            // Cancelled or panicked leader: clear the slot so a follower
            // can take over, then drop the sender to wake them.
            self.remove_entry();
        }
    }
}

/// Single-flight coordination map.
#[derive(Default)]
pub struct SingleFlight {
    inflight: Arc<Mutex<HashMap<u64, watch::Receiver<Shared>>>>,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins or starts the flight for `key`.
    ///
    /// Returns [`Flight::Leader`] for the first caller; later callers
    /// suspend until the leader publishes and then receive
    /// [`Flight::Shared`]. If the leader is cancelled, one suspended
    /// caller becomes the new leader.
    pub async fn begin(&self, key: u64) -> Flight {
        loop {
            let mut receiver = {
                let mut inflight = self.inflight.lock();
                match inflight.get(&key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key, rx);
                        return Flight::Leader(FlightGuard {
                            key,
                            inflight: Arc::clone(&self.inflight),
                            tx,
                            published: false,
                        });
                    }
                }
            };

            match receiver.changed().await {
                Ok(()) => {
                    if let Some(response) = receiver.borrow().clone() {
                        return Flight::Shared(response);
                    }
                    // Spurious wake without a value: retry as leader.
                }
                Err(_) => {
                    // Leader dropped without publishing; loop to take over.
                }
            }
        }
    }

    /// Number of flights currently in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}
