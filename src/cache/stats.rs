//! Cache Statistics Module
//!
//! Tracks per-cache metrics: hits, misses, refreshes, evictions, flushes
//! and invalidations. Counters are atomic so every tier can record from
//! foreground and background paths without taking its data lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time snapshot of cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Requests served from a still-valid cache
    pub hits: u64,
    /// Requests that found nothing usable and had to fetch
    pub misses: u64,
    /// Fetches performed (synchronous and background)
    pub refreshes: u64,
    /// Entries evicted to respect capacity
    pub evictions: u64,
    /// Entities handed to the persist callback
    pub flushes: u64,
    /// Persist callbacks that failed
    pub persist_failures: u64,
    /// Entries removed by invalidation
    pub invalidations: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total number of lookups observed.
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }
}

// == Stats Recorder ==
/// Lock-free counters behind a [`CacheStats`] snapshot.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    /// Hits + misses, advanced once per lookup
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
    persist_failures: AtomicU64,
    invalidations: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a hit and returns the number of requests seen so far.
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records a miss and returns the number of requests seen so far.
    pub fn record_miss(&self) -> u64 {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
    }

    // == Snapshot ==
    /// Returns current counters together with the given entry count.
    pub fn snapshot(&self, total_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            total_entries,
        }
    }
}
