//! Per-request tile loading: serve from cache, or fetch, store and record
//!
//! Concurrent misses for the same URL share one spawned fetch task. The task
//! is detached from its callers, so a caller that gives up waiting never
//! cancels the store and index update the other waiters rely on.

use crate::cache::Cache;
use crate::error::CacheError;
use crate::fetcher::TileFetcher;
use crate::stats::{CacheStats, StatsCounters};
use crate::types::{RecordDelta, TileOutcome};
use bytes::Bytes;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

type SharedFetch = Shared<BoxFuture<'static, TileOutcome>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

/// Resolves tile requests for the rendering surface.
///
/// Cloning is cheap; clones share the cache handle and in-flight table.
#[derive(Clone)]
pub struct TileLoadCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Option<Arc<Cache>>,
    fetcher: Arc<dyn TileFetcher>,
    counters: Arc<StatsCounters>,
    disabled: AtomicBool,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_fetch_id: AtomicU64,
}

impl TileLoadCoordinator {
    pub fn new(cache: Arc<Cache>, fetcher: Arc<dyn TileFetcher>) -> Self {
        let counters = cache.counters().clone();
        Self::build(Some(cache), fetcher, counters)
    }

    /// Coordinator for a session whose cache could not be opened
    pub fn uncached(fetcher: Arc<dyn TileFetcher>) -> Self {
        Self::build(None, fetcher, Arc::new(StatsCounters::default()))
    }

    fn build(
        cache: Option<Arc<Cache>>,
        fetcher: Arc<dyn TileFetcher>,
        counters: Arc<StatsCounters>,
    ) -> Self {
        let disabled = cache.is_none();
        Self {
            inner: Arc::new(Inner {
                cache,
                fetcher,
                counters,
                disabled: AtomicBool::new(disabled),
                in_flight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
            }),
        }
    }

    /// False once the cache has been found unavailable this session
    pub fn caching_enabled(&self) -> bool {
        !self.inner.disabled.load(Ordering::Acquire)
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.inner.cache.as_ref()
    }

    pub async fn stats(&self) -> CacheStats {
        match &self.inner.cache {
            Some(cache) => cache.stats().await,
            None => self.inner.counters.snapshot(0, 0),
        }
    }

    /// Resolve one tile request. Always returns an outcome; failures on the
    /// cache path degrade to a direct fetch.
    pub async fn load(&self, url: &str) -> TileOutcome {
        let Some(cache) = self.inner.active_cache() else {
            return self.inner.fetch_direct(url).await;
        };

        match self.inner.serve_hit(&cache, url).await {
            Ok(Some(bytes)) => return TileOutcome::Hit(bytes),
            Ok(None) => {}
            Err(e) => {
                if e.is_unavailable() {
                    self.inner.disable(&e);
                } else {
                    warn!(url, error = %e, "Cache lookup failed, fetching directly");
                }
                return self.inner.fetch_direct(url).await;
            }
        }

        StatsCounters::bump(&self.inner.counters.misses);
        let (fetch, leader) = self.inner.join_or_start(&cache, url);
        let outcome = fetch.await;

        // The task recorded the leader's access; joined waiters record their own
        if !leader && outcome.is_served() {
            self.inner.record_access(&cache, url).await;
        }
        outcome
    }
}

impl Inner {
    fn active_cache(&self) -> Option<Arc<Cache>> {
        if self.disabled.load(Ordering::Acquire) {
            return None;
        }
        self.cache.clone()
    }

    fn disable(&self, err: &CacheError) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            warn!(error = %err, "Offline caching disabled this session");
        }
    }

    async fn serve_hit(&self, cache: &Cache, url: &str) -> crate::Result<Option<Bytes>> {
        let _session = cache.session().await;
        let _guard = cache.locks().lock(url).await;
        let Some(bytes) = cache.blobs().get(url).await? else {
            return Ok(None);
        };

        StatsCounters::bump(&self.counters.hits);
        self.upsert_held(cache, url, RecordDelta::default()).await;
        debug!(url, "Served tile from cache");
        Ok(Some(bytes))
    }

    async fn record_access(&self, cache: &Cache, url: &str) {
        let _session = cache.session().await;
        let _guard = cache.locks().lock(url).await;
        self.upsert_held(cache, url, RecordDelta::default()).await;
    }

    /// Index failures only cost eviction accuracy, so they never fail the request
    async fn upsert_held(&self, cache: &Cache, url: &str, delta: RecordDelta) {
        if let Err(e) = cache.index().upsert_held(url, delta, Utc::now()).await {
            StatsCounters::bump(&self.counters.index_write_failures);
            warn!(url, error = %e, "Failed to record tile usage");
        }
    }

    async fn fetch_direct(&self, url: &str) -> TileOutcome {
        match self.fetcher.fetch(url).await {
            Ok(bytes) => {
                StatsCounters::bump(&self.counters.bypassed);
                TileOutcome::Bypassed(bytes)
            }
            Err(e) => self.fall_back(url, &e),
        }
    }

    fn fall_back(&self, url: &str, err: &CacheError) -> TileOutcome {
        StatsCounters::bump(&self.counters.fetch_failures);
        StatsCounters::bump(&self.counters.direct_fallbacks);
        warn!(url, error = %err, "Tile fetch failed, handing URL back to the surface");
        TileOutcome::Direct(url.to_string())
    }

    fn join_or_start(self: &Arc<Self>, cache: &Arc<Cache>, url: &str) -> (SharedFetch, bool) {
        // Held across spawn + insert so the task cannot unregister before it is registered
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = in_flight.get(url) {
            debug!(url, "Joining in-flight fetch");
            return (existing.fetch.clone(), false);
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(self.clone().populate(cache.clone(), url.to_string(), id));

        let fallback_url = url.to_string();
        let fetch = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(url = %fallback_url, error = %e, "Tile fetch task failed");
                    TileOutcome::Direct(fallback_url)
                }
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            url.to_string(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        (fetch, true)
    }

    fn unregister(&self, url: &str, id: u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(url).map(|f| f.id) == Some(id) {
            in_flight.remove(url);
        }
    }

    async fn populate(self: Arc<Self>, cache: Arc<Cache>, url: String, id: u64) -> TileOutcome {
        let outcome = self.fetch_and_store(&cache, &url).await;
        self.unregister(&url, id);
        outcome
    }

    async fn fetch_and_store(&self, cache: &Cache, url: &str) -> TileOutcome {
        let generation = cache.generation();

        // A peer may have stored the tile between our lookup and registration
        match self.serve_hit(cache, url).await {
            Ok(Some(bytes)) => return TileOutcome::Hit(bytes),
            Ok(None) => {}
            Err(e) => warn!(url, error = %e, "Cache re-check failed"),
        }

        StatsCounters::bump(&self.counters.fetches);
        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fall_back(url, &e),
        };

        let _session = cache.session().await;
        let _guard = cache.locks().lock(url).await;

        if cache.generation() != generation {
            debug!(url, "Cache reset during fetch, not storing");
            StatsCounters::bump(&self.counters.bypassed);
            return TileOutcome::Bypassed(bytes);
        }

        if let Err(e) = cache.blobs().put(url, bytes.clone()).await {
            StatsCounters::bump(&self.counters.store_write_failures);
            StatsCounters::bump(&self.counters.bypassed);
            warn!(url, error = %e, "Failed to store tile, serving uncached");
            if e.is_unavailable() {
                self.disable(&e);
            }
            return TileOutcome::Bypassed(bytes);
        }

        // Serve what was stored, through the same read path as a hit
        let stored = match cache.blobs().get(url).await {
            Ok(Some(stored)) => stored,
            result => {
                if let Err(e) = result {
                    warn!(url, error = %e, "Stored tile unreadable");
                }
                StatsCounters::bump(&self.counters.store_write_failures);
                StatsCounters::bump(&self.counters.bypassed);
                if let Err(e) = cache.blobs().delete(url).await {
                    warn!(url, error = %e, "Failed to drop unreadable tile");
                }
                return TileOutcome::Bypassed(bytes);
            }
        };

        self.upsert_held(cache, url, RecordDelta::fetched_at(Utc::now()))
            .await;
        debug!(url, size = stored.len(), "Fetched and cached tile");
        TileOutcome::Fetched(stored)
    }
}
