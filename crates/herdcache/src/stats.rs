//! Guard layer statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing what the read and write paths decided
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    null_hits: AtomicU64,
    misses: AtomicU64,
    bloom_rejections: AtomicU64,
    computations: AtomicU64,
    lock_busy: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Payload served from the cache
    pub hits: u64,
    /// Null sentinel served from the cache
    pub null_hits: u64,
    /// No entry in the cache
    pub misses: u64,
    /// Requests answered by the bloom filter alone
    pub bloom_rejections: u64,
    /// Compute callbacks executed
    pub computations: u64,
    /// Lock acquisitions that timed out
    pub lock_busy: u64,
    /// Cold to hot transitions
    pub promotions: u64,
    /// Hot to cold transitions
    pub demotions: u64,
}

impl CacheStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a payload hit
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sentinel hit
    pub fn record_null_hit(&self) {
        self.null_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bloom rejection
    pub fn record_bloom_rejection(&self) {
        self.bloom_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a compute callback run
    pub fn record_computation(&self) {
        self.computations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lock timeout
    pub fn record_lock_busy(&self) {
        self.lock_busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a promotion
    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a demotion
    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total payload hits
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get total sentinel hits
    pub fn null_hits(&self) -> u64 {
        self.null_hits.load(Ordering::Relaxed)
    }

    /// Get total misses
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get total bloom rejections
    pub fn bloom_rejections(&self) -> u64 {
        self.bloom_rejections.load(Ordering::Relaxed)
    }

    /// Get total compute runs
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Get total lock timeouts
    pub fn lock_busy(&self) -> u64 {
        self.lock_busy.load(Ordering::Relaxed)
    }

    /// Get total promotions
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// Get total demotions
    pub fn demotions(&self) -> u64 {
        self.demotions.load(Ordering::Relaxed)
    }

    /// Share of lookups answered from the cache (0.0 to 1.0)
    ///
    /// Sentinel hits count as hits: they spared the backend just the same.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() + self.null_hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Copy every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            null_hits: self.null_hits(),
            misses: self.misses(),
            bloom_rejections: self.bloom_rejections(),
            computations: self.computations(),
            lock_busy: self.lock_busy(),
            promotions: self.promotions(),
            demotions: self.demotions(),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.null_hits,
            &self.misses,
            &self.bloom_rejections,
            &self.computations,
            &self.lock_busy,
            &self.promotions,
            &self.demotions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
