//! Runtime cache statistics: lock-free atomic counters with a serializable
//! `snapshot()`, for operational visibility into hit rates.
//!
//! One atomic counter per outcome kind, `Ordering::Relaxed` since these
//! are approximate operational counters rather than a correctness
//! boundary, with a `snapshot()` that computes a derived `hit_rate`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hit/miss counters for a plain two-outcome cache (`CacheAside`,
/// `WriteThrough`'s implicit cache-aside repopulation path).
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Hit/miss counters for the three-outcome `SemanticCache` (exact, semantic,
/// none), split as `hits_exact`/`hits_semantic`/`misses`.
#[derive(Default)]
pub struct SemanticCacheStats {
    hits_exact: AtomicU64,
    hits_semantic: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exact_hit(&self) {
        self.hits_exact.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_semantic_hit(&self) {
        self.hits_semantic.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SemanticCacheStatsSnapshot {
        let hits_exact = self.hits_exact.load(Ordering::Relaxed);
        let hits_semantic = self.hits_semantic.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits_exact + hits_semantic + misses;
        SemanticCacheStatsSnapshot {
            hits_exact,
            hits_semantic,
            misses,
            hit_rate: if total > 0 {
                (hits_exact + hits_semantic) as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SemanticCacheStatsSnapshot {
    pub hits_exact: u64,
    pub hits_semantic: u64,
    pub misses: u64,
    pub hit_rate: f64,
}
