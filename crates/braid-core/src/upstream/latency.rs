//! Latency percentile tracking over a sliding sample window.
//!
//! A lock-free atomic ring buffer of recent latency samples. Recording is
//! `&self` through atomics so many tasks can record concurrently;
//! percentile reads collect and sort on demand. Stale data (no samples
//! within the staleness threshold) yields `None` so hedge delays are never
//! derived from outdated history.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Default staleness threshold in seconds (5 minutes).
const DEFAULT_STALENESS_THRESHOLD_SECS: u64 = 300;

pub struct LatencyTracker {
    /// Ring buffer of samples; 0 marks an empty slot.
    samples: Box<[AtomicU64]>,
    max_samples: usize,
    write_index: AtomicUsize,
    count: AtomicUsize,
    /// Unix timestamp in ms of the last recorded sample (0 = never).
    last_updated_ms: AtomicU64,
    staleness_threshold_secs: u64,
}

impl LatencyTracker {
    #[must_use]
    pub fn new(max_samples: usize) -> Self {
        Self::with_staleness_threshold(max_samples, DEFAULT_STALENESS_THRESHOLD_SECS)
    }

    #[must_use]
    pub fn with_staleness_threshold(max_samples: usize, staleness_threshold_secs: u64) -> Self {
        let samples = (0..max_samples).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
        Self {
            samples: samples.into_boxed_slice(),
            max_samples,
            write_index: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            last_updated_ms: AtomicU64::new(0),
            staleness_threshold_secs,
        }
    }

    fn now_ms() -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Returns `true` if no sample has arrived within the staleness window.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let last_ms = self.last_updated_ms.load(Ordering::Relaxed);
        if last_ms == 0 {
            return true;
        }
        (Self::now_ms().saturating_sub(last_ms)) / 1000 > self.staleness_threshold_secs
    }

    /// Records a latency sample. Zero is clamped to 1ms so empty slots stay
    /// distinguishable.
    pub fn record(&self, latency_ms: u64) {
        let index = self.write_index.fetch_add(1, Ordering::Relaxed) % self.max_samples;
        let old = self.samples[index].swap(latency_ms.max(1), Ordering::Relaxed);

        if old == 0 {
            self.count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                    Some(c.saturating_add(1).min(self.max_samples))
                })
                .ok();
        }

        self.last_updated_ms.store(Self::now_ms(), Ordering::Relaxed);
    }

    /// Calculates the given percentile over recorded samples.
    ///
    /// Returns `None` with no samples, an out-of-range quantile, or stale
    /// data.
    #[must_use]
    pub fn percentile(&self, quantile: f64) -> Option<u64> {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 || !(0.0..=1.0).contains(&quantile) || self.is_stale() {
            return None;
        }

        let mut sorted: Vec<u64> = self
            .samples
            .iter()
            .take(count)
            .map(|a| a.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = ((sorted.len() as f64 - 1.0) * quantile) as usize;
        Some(sorted[index])
    }

    /// Number of samples currently tracked.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
