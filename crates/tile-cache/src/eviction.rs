//! Garbage collection of cached tiles under storage pressure
//!
//! A pass evicts the least-recently-used third of the index outright, then
//! half of what remains, picking the least-fetched tiles first.

use crate::cache::Cache;
use crate::error::{CacheError, Result};
use crate::estimate::StorageEstimator;
use crate::stats::StatsCounters;
use crate::types::{EvictionReport, TileRecord};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reorder `records` so the victims of one pass form a prefix, and return it.
///
/// Ordering is total (ties fall back to `id`), so the same snapshot always
/// yields the same victims.
pub fn select_victims(records: &mut [TileRecord]) -> &[TileRecord] {
    let n = records.len();
    records.sort_by(by_recency);

    if n < 3 {
        return records;
    }

    let stale = n / 3;
    let rest = &mut records[stale..];
    rest.sort_by(by_frequency);
    let infrequent = rest.len().div_ceil(2);

    &records[..stale + infrequent]
}

fn by_recency(a: &TileRecord, b: &TileRecord) -> Ordering {
    a.last_used
        .cmp(&b.last_used)
        .then_with(|| a.id.cmp(&b.id))
}

fn by_frequency(a: &TileRecord, b: &TileRecord) -> Ordering {
    a.fetch_count
        .cmp(&b.fetch_count)
        .then_with(|| by_recency(a, b))
}

/// Result of a single pass over the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub selected: usize,
    pub evicted: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct EvictionEngine {
    cache: Arc<Cache>,
    estimator: Arc<dyn StorageEstimator>,
}

impl EvictionEngine {
    pub fn new(cache: Arc<Cache>, estimator: Arc<dyn StorageEstimator>) -> Self {
        Self { cache, estimator }
    }

    /// Evict if storage is at or above the high-water mark.
    ///
    /// Runs at most `1 + max_extra_passes` passes and warns when pressure
    /// persists after the last one.
    pub async fn check(&self) -> Result<EvictionReport> {
        let config = self.cache.config();
        let before = self.estimator.estimate().await?;
        let mut report = EvictionReport {
            before,
            after: before,
            ..EvictionReport::default()
        };

        info!(
            usage_mb = before.usage / 1_000_000,
            quota_mb = before.quota / 1_000_000,
            "Storage estimate"
        );

        if !before.is_at_or_above(config.high_water_mark) {
            return Ok(report);
        }
        report.triggered = true;

        loop {
            let pass = self.run_pass().await;
            report.passes += 1;
            report.selected += pass.selected;
            report.evicted += pass.evicted;
            report.failed += pass.failed;
            report.skipped += pass.skipped;

            report.after = self.estimator.estimate().await?;
            if !report.after.is_at_or_above(config.high_water_mark) {
                break;
            }
            if report.passes > config.max_extra_passes || pass.selected == 0 {
                report.pressure_persists = true;
                warn!(
                    passes = report.passes,
                    usage = report.after.usage,
                    quota = report.after.quota,
                    "Storage pressure persists after eviction"
                );
                break;
            }
        }

        if report.failed > 0 {
            let err = CacheError::EvictionPartialFailure {
                failed: report.failed,
                attempted: report.selected,
            };
            warn!(error = %err, "Failed victims will be retried on the next check");
        }

        info!(
            passes = report.passes,
            evicted = report.evicted,
            failed = report.failed,
            skipped = report.skipped,
            "Eviction finished"
        );
        Ok(report)
    }

    /// Select victims from a fresh snapshot and delete them
    pub async fn run_pass(&self) -> PassOutcome {
        let mut snapshot = self.cache.index().get_all().await;
        let victims = select_victims(&mut snapshot);
        self.evict(victims).await
    }

    /// Delete each victim whose record still matches the snapshot it came from
    async fn evict(&self, victims: &[TileRecord]) -> PassOutcome {
        let _session = self.cache.session().await;
        let mut outcome = PassOutcome {
            selected: victims.len(),
            ..PassOutcome::default()
        };

        for victim in victims {
            let _guard = self.cache.locks().lock(&victim.id).await;

            match self.cache.index().get(&victim.id).await {
                Some(current) if current == *victim => {}
                Some(_) => {
                    debug!(url = %victim.id, "Tile used since snapshot, keeping it");
                    outcome.skipped += 1;
                    continue;
                }
                None => {
                    outcome.skipped += 1;
                    continue;
                }
            }

            // Blob first, so a failed blob delete leaves the pair intact
            if let Err(e) = self.cache.blobs().delete(&victim.id).await {
                warn!(url = %victim.id, error = %e, "Failed to delete tile blob");
                outcome.failed += 1;
                continue;
            }
            if let Err(e) = self.cache.index().remove_held(&victim.id).await {
                warn!(url = %victim.id, error = %e, "Failed to delete tile record");
                outcome.failed += 1;
                continue;
            }
            outcome.evicted += 1;
        }

        let counters = self.cache.counters();
        StatsCounters::add(&counters.evicted, outcome.evicted);
        StatsCounters::add(&counters.eviction_failures, outcome.failed);

        debug!(
            selected = outcome.selected,
            evicted = outcome.evicted,
            failed = outcome.failed,
            "Eviction pass done"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, MemoryBlobStore};
    use crate::types::{CacheConfig, RecordDelta, StorageEstimate};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::{BTreeSet, HashSet, VecDeque};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_645_293_015_978 + ms).unwrap()
    }

    fn record(id: &str, last_used: i64, fetch_count: u64) -> TileRecord {
        TileRecord {
            id: id.to_string(),
            first_fetched: at(0),
            last_used: at(last_used),
            fetch_count,
        }
    }

    fn ids(victims: &[TileRecord]) -> BTreeSet<String> {
        victims.iter().map(|r| r.id.clone()).collect()
    }

    fn expected_victims(n: usize) -> usize {
        if n < 3 {
            return n;
        }
        let stale = n / 3;
        stale + (n - stale).div_ceil(2)
    }

    #[test]
    fn test_empty_index_selects_nothing() {
        let mut records: Vec<TileRecord> = Vec::new();
        assert!(select_victims(&mut records).is_empty());
    }

    #[test]
    fn test_small_index_evicts_everything() {
        let mut one = vec![record("a", 1, 9)];
        assert_eq!(select_victims(&mut one).len(), 1);

        let mut two = vec![record("a", 1, 9), record("b", 2, 1)];
        assert_eq!(select_victims(&mut two).len(), 2);
    }

    #[test]
    fn test_victim_count_formula() {
        for n in 0..40usize {
            let mut records: Vec<TileRecord> = (0..n)
                .map(|i| record(&format!("tile-{i:02}"), i as i64, (i % 7) as u64 + 1))
                .collect();
            let victims = select_victims(&mut records);
            assert_eq!(victims.len(), expected_victims(n), "n = {n}");
            assert!(victims.len() <= n);
        }
    }

    #[test]
    fn test_six_tile_scenario() {
        // A oldest ... F newest
        let mut records = vec![
            record("F", 6, 3),
            record("E", 5, 7),
            record("D", 4, 6),
            record("C", 3, 5),
            record("B", 2, 1),
            record("A", 1, 2),
        ];
        let victims = ids(select_victims(&mut records));

        // Oldest third goes regardless of count
        assert!(victims.contains("A"));
        assert!(victims.contains("B"));
        // Lowest counts among C..F are F (3) then C (5)
        assert!(victims.contains("F"));
        assert!(victims.contains("C"));
        assert!(!victims.contains("D"));
        assert!(!victims.contains("E"));
        assert_eq!(victims.len(), 4);
    }

    #[test]
    fn test_frequent_old_tile_still_evicted() {
        let mut records = vec![
            record("old-popular", 1, 1000),
            record("b", 2, 1),
            record("c", 3, 1),
            record("d", 4, 1),
            record("e", 5, 1),
            record("f", 6, 1),
        ];
        let victims = ids(select_victims(&mut records));
        assert!(victims.contains("old-popular"));
    }

    #[test]
    fn test_frequency_tie_prefers_older() {
        let mut records = vec![
            record("a", 1, 1),
            record("b", 2, 10),
            record("c", 3, 10),
            record("d", 4, 2),
            record("e", 5, 2),
            record("f", 6, 2),
        ];
        // Stage A: a, b. Remaining c(10) d(2) e(2) f(2): take two, oldest of the 2s
        let victims = ids(select_victims(&mut records));
        let expected: BTreeSet<String> =
            ["a", "b", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(victims, expected);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let build = || -> Vec<TileRecord> {
            (0..12)
                .map(|i| record(&format!("tile-{}", 11 - i), 5, 1))
                .collect()
        };

        let mut first = build();
        let mut second = build();
        second.reverse();

        assert_eq!(ids(select_victims(&mut first)), ids(select_victims(&mut second)));
    }

    /// Estimator returning scripted values, repeating the last one
    struct ScriptedEstimator {
        values: Mutex<VecDeque<StorageEstimate>>,
    }

    impl ScriptedEstimator {
        fn new(values: &[(u64, u64)]) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(
                    values
                        .iter()
                        .map(|&(usage, quota)| StorageEstimate { usage, quota })
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl StorageEstimator for ScriptedEstimator {
        async fn estimate(&self) -> Result<StorageEstimate> {
            let mut values = self.values.lock().unwrap();
            if values.len() > 1 {
                Ok(values.pop_front().unwrap())
            } else {
                Ok(*values.front().unwrap())
            }
        }
    }

    /// Memory store whose deletes fail for chosen keys
    struct StubbornStore {
        inner: MemoryBlobStore,
        undeletable: HashSet<String>,
    }

    #[async_trait]
    impl BlobStore for StubbornStore {
        async fn get(&self, url: &str) -> Result<Option<Bytes>> {
            self.inner.get(url).await
        }
        async fn put(&self, url: &str, data: Bytes) -> Result<()> {
            self.inner.put(url, data).await
        }
        async fn delete(&self, url: &str) -> Result<()> {
            if self.undeletable.contains(url) {
                return Err(CacheError::Io(Box::new(std::io::Error::other("busy"))));
            }
            self.inner.delete(url).await
        }
        async fn list_keys(&self) -> Result<BTreeSet<String>> {
            self.inner.list_keys().await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
        async fn usage_bytes(&self) -> Result<u64> {
            self.inner.usage_bytes().await
        }
    }

    async fn cache_with(blobs: Arc<dyn BlobStore>) -> (TempDir, Arc<Cache>) {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        let cache = Cache::with_store(config, blobs).await.unwrap();
        (dir, Arc::new(cache))
    }

    async fn seed(cache: &Cache, count: usize) {
        for i in 0..count {
            let url = format!("https://tiles.example/{i}");
            cache
                .blobs()
                .put(&url, Bytes::from_static(b"tile"))
                .await
                .unwrap();
            cache
                .index()
                .upsert_held(&url, RecordDelta::fetched_at(at(i as i64)), at(i as i64))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_below_high_water_does_nothing() {
        let (_dir, cache) = cache_with(Arc::new(MemoryBlobStore::new())).await;
        seed(&cache, 6).await;

        let engine = EvictionEngine::new(cache.clone(), ScriptedEstimator::new(&[(50, 100)]));
        let report = engine.check().await.unwrap();

        assert!(!report.triggered);
        assert_eq!(report.passes, 0);
        assert_eq!(cache.index().len().await, 6);
    }

    #[tokio::test]
    async fn test_pass_keeps_stores_in_lockstep() {
        let (_dir, cache) = cache_with(Arc::new(MemoryBlobStore::new())).await;
        seed(&cache, 9).await;

        let engine =
            EvictionEngine::new(cache.clone(), ScriptedEstimator::new(&[(90, 100), (20, 100)]));
        let report = engine.check().await.unwrap();

        assert!(report.triggered);
        assert_eq!(report.passes, 1);
        assert_eq!(report.evicted, expected_victims(9));
        assert!(!report.pressure_persists);

        let remaining: BTreeSet<String> =
            cache.records().await.into_iter().map(|r| r.id).collect();
        let keys = cache.blobs().list_keys().await.unwrap();
        assert_eq!(remaining, keys);
        assert_eq!(remaining.len(), 9 - expected_victims(9));
        // The three oldest are gone
        for i in 0..3 {
            assert!(!remaining.contains(&format!("https://tiles.example/{i}")));
        }
        assert_eq!(cache.stats().await.evicted, expected_victims(9) as u64);
    }

    #[tokio::test]
    async fn test_failed_blob_delete_keeps_record() {
        let stubborn = StubbornStore {
            inner: MemoryBlobStore::new(),
            undeletable: ["https://tiles.example/0".to_string()].into_iter().collect(),
        };
        let (_dir, cache) = cache_with(Arc::new(stubborn)).await;
        seed(&cache, 6).await;

        let engine =
            EvictionEngine::new(cache.clone(), ScriptedEstimator::new(&[(90, 100), (10, 100)]));
        let report = engine.check().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.evicted, expected_victims(6) - 1);
        assert!(cache.index().get("https://tiles.example/0").await.is_some());
        assert!(cache
            .blobs()
            .get("https://tiles.example/0")
            .await
            .unwrap()
            .is_some());
        assert_eq!(cache.stats().await.eviction_failures, 1);
    }

    #[tokio::test]
    async fn test_victim_used_since_snapshot_survives() {
        let (_dir, cache) = cache_with(Arc::new(MemoryBlobStore::new())).await;
        seed(&cache, 6).await;
        let engine = EvictionEngine::new(cache.clone(), ScriptedEstimator::new(&[(90, 100)]));

        let mut snapshot = cache.records().await;
        let victims = select_victims(&mut snapshot).to_vec();
        let touched = "https://tiles.example/0";
        assert!(victims.iter().any(|v| v.id == touched));

        cache
            .index()
            .upsert(touched, RecordDelta::default())
            .await
            .unwrap();

        let outcome = engine.evict(&victims).await;

        assert_eq!(outcome.selected, victims.len());
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.evicted, victims.len() - 1);
        assert_eq!(outcome.failed, 0);

        let record = cache.index().get(touched).await.unwrap();
        assert_eq!(record.fetch_count, 2);
        assert!(cache.blobs().get(touched).await.unwrap().is_some());

        let remaining: BTreeSet<String> =
            cache.records().await.into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, cache.blobs().list_keys().await.unwrap());
    }

    #[tokio::test]
    async fn test_persistent_pressure_is_capped() {
        let (_dir, cache) = cache_with(Arc::new(MemoryBlobStore::new())).await;
        seed(&cache, 30).await;

        // Estimate never drops
        let engine = EvictionEngine::new(cache.clone(), ScriptedEstimator::new(&[(99, 100)]));
        let report = engine.check().await.unwrap();

        assert_eq!(report.passes, 2);
        assert!(report.pressure_persists);
        assert!(!cache.index().is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_index_under_pressure() {
        let (_dir, cache) = cache_with(Arc::new(MemoryBlobStore::new())).await;

        let engine = EvictionEngine::new(cache.clone(), ScriptedEstimator::new(&[(99, 100)]));
        let report = engine.check().await.unwrap();

        assert!(report.triggered);
        assert_eq!(report.passes, 1);
        assert_eq!(report.selected, 0);
        assert!(report.pressure_persists);
    }
}
