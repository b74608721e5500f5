//! Cache counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub store_write_failures: u64,
    pub index_write_failures: u64,
    pub bypassed: u64,
    pub direct_fallbacks: u64,
    pub evicted: u64,
    pub eviction_failures: u64,
}

/// Live counters shared by the coordinator and the eviction engine
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) fetches: AtomicU64,
    pub(crate) fetch_failures: AtomicU64,
    pub(crate) store_write_failures: AtomicU64,
    pub(crate) index_write_failures: AtomicU64,
    pub(crate) bypassed: AtomicU64,
    pub(crate) direct_fallbacks: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) eviction_failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Fill in the counter fields; `entries` and `total_size` come from the stores
    pub fn snapshot(&self, entries: usize, total_size: u64) -> CacheStats {
        CacheStats {
            entries,
            total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            store_write_failures: self.store_write_failures.load(Ordering::Relaxed),
            index_write_failures: self.index_write_failures.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            direct_fallbacks: self.direct_fallbacks.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
        }
    }
}
