//! The cache session: blob store, usage index and key locks owned as one unit

use crate::blob_store::{BlobStore, FsBlobStore};
use crate::error::Result;
use crate::index::MetadataIndex;
use crate::locks::KeyLocks;
use crate::stats::{CacheStats, StatsCounters};
use crate::types::{CacheConfig, TileRecord};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{info, warn};

/// One cache per map session.
///
/// Opened once and shared by handle with the coordinator and the eviction
/// engine. `reset` empties both stores; the session stays usable afterwards.
///
/// Paths that touch both stores hold the session lock shared, and `reset`
/// holds it exclusively, so no hit, store or eviction straddles a reset.
pub struct Cache {
    config: CacheConfig,
    blobs: Arc<dyn BlobStore>,
    index: MetadataIndex,
    locks: Arc<KeyLocks>,
    stats: Arc<StatsCounters>,
    generation: AtomicU64,
    session: RwLock<()>,
}

impl Cache {
    /// Open the on-disk cache under `config.cache_dir()`
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let blobs = FsBlobStore::open(config.cache_dir().join("blobs")).await?;
        Self::with_store(config, Arc::new(blobs)).await
    }

    /// Open the index under `config.cache_dir()` next to a caller-supplied blob store
    pub async fn with_store(config: CacheConfig, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let locks = Arc::new(KeyLocks::new());
        let index = MetadataIndex::open(config.cache_dir().join("index"), locks.clone()).await?;

        let cache = Self {
            config,
            blobs,
            index,
            locks,
            stats: Arc::new(StatsCounters::default()),
            generation: AtomicU64::new(0),
            session: RwLock::new(()),
        };
        cache.reconcile().await?;

        info!(
            namespace = %cache.config.namespace(),
            records = cache.index.len().await,
            "Tile cache opened"
        );
        Ok(cache)
    }

    /// Drop records without blobs and blobs without records
    async fn reconcile(&self) -> Result<()> {
        let keys = self.blobs.list_keys().await?;
        let records: BTreeSet<String> = self
            .index
            .get_all()
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();

        let orphan_records: Vec<&String> = records.difference(&keys).collect();
        let orphan_blobs: Vec<&String> = keys.difference(&records).collect();

        if !orphan_records.is_empty() {
            warn!(count = orphan_records.len(), "Removing tile records with no blob");
            self.index.remove(orphan_records).await?;
        }
        for url in &orphan_blobs {
            warn!(url = %url, "Removing blob with no tile record");
            self.blobs.delete(url).await?;
        }

        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub(crate) fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    pub(crate) fn counters(&self) -> &Arc<StatsCounters> {
        &self.stats
    }

    /// Shared hold on the session; take it before any key lock
    pub(crate) async fn session(&self) -> RwLockReadGuard<'_, ()> {
        self.session.read().await
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot of the usage index
    pub async fn records(&self) -> Vec<TileRecord> {
        self.index.get_all().await
    }

    pub async fn stats(&self) -> CacheStats {
        let total_size = match self.blobs.usage_bytes().await {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "Failed to measure blob usage");
                0
            }
        };
        self.stats.snapshot(self.index.len().await, total_size)
    }

    /// Destroy every blob and every record
    pub async fn reset(&self) -> Result<()> {
        let _session = self.session.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.blobs.clear().await?;
        self.index.destroy_all().await?;
        info!(namespace = %self.config.namespace(), "Tile cache reset");
        Ok(())
    }
}
