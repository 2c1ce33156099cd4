//! Process-wide observability counters.
//!
//! The core is indifferent to how these are exported; embedders may scrape
//! [`snapshot`] from any metrics endpoint. Counters are plain atomics so the
//! hot path never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bucket bounds for the search latency histogram, in seconds.
pub const LATENCY_BUCKETS: [f64; 8] = [0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25];

#[derive(Debug, Default)]
struct Registry {
    vector_inserts_total: AtomicU64,
    search_queries_total: AtomicU64,
    search_errors_total: AtomicU64,
    latency_buckets: [AtomicU64; 8],
    latency_count: AtomicU64,
    latency_sum_micros: AtomicU64,
}

static REGISTRY: Registry = Registry {
    vector_inserts_total: AtomicU64::new(0),
    search_queries_total: AtomicU64::new(0),
    search_errors_total: AtomicU64::new(0),
    latency_buckets: [
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
    ],
    latency_count: AtomicU64::new(0),
    latency_sum_micros: AtomicU64::new(0),
};

/// Records a successful vector insert.
pub fn record_insert() {
    REGISTRY.vector_inserts_total.fetch_add(1, Ordering::Relaxed);
}

/// Records a search query and its latency.
pub fn record_search(latency: Duration) {
    REGISTRY.search_queries_total.fetch_add(1, Ordering::Relaxed);
    REGISTRY.latency_count.fetch_add(1, Ordering::Relaxed);
    let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
    REGISTRY.latency_sum_micros.fetch_add(micros, Ordering::Relaxed);
    let secs = latency.as_secs_f64();
    for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
        if secs <= *bound {
            REGISTRY.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Records a failed search.
pub fn record_search_error() {
    REGISTRY.search_errors_total.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Total vectors inserted since process start.
    pub vector_inserts_total: u64,
    /// Total search queries served.
    pub search_queries_total: u64,
    /// Total search queries that returned an error.
    pub search_errors_total: u64,
    /// Cumulative latency bucket counts, aligned with [`LATENCY_BUCKETS`].
    pub search_latency_buckets: [u64; 8],
    /// Number of latency observations.
    pub search_latency_count: u64,
    /// Sum of observed latencies, in microseconds.
    pub search_latency_sum_micros: u64,
}

/// Reads all counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    let mut buckets = [0u64; 8];
    for (out, counter) in buckets.iter_mut().zip(REGISTRY.latency_buckets.iter()) {
        *out = counter.load(Ordering::Relaxed);
    }
    MetricsSnapshot {
        vector_inserts_total: REGISTRY.vector_inserts_total.load(Ordering::Relaxed),
        search_queries_total: REGISTRY.search_queries_total.load(Ordering::Relaxed),
        search_errors_total: REGISTRY.search_errors_total.load(Ordering::Relaxed),
        search_latency_buckets: buckets,
        search_latency_count: REGISTRY.latency_count.load(Ordering::Relaxed),
        search_latency_sum_micros: REGISTRY.latency_sum_micros.load(Ordering::Relaxed),
    }
}
