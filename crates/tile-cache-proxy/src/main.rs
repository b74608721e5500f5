//! Tile cache proxy - offline map tile cache in front of tile servers
//!
//! Rendering surfaces request `/tile?url=...`; tiles are served from the
//! local cache when present and fetched, stored and recorded otherwise.

mod error;
mod server;
mod types;

use crate::error::{ProxyError, Result};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tile_cache::{
    BlobUsageEstimator, Cache, CacheConfig, EvictionEngine, HttpTileFetcher, TileLoadCoordinator,
};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("tile_cache_proxy=info".parse()?)
        .add_directive("tile_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting tile cache proxy...");

    let config = load_config()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir());
    info!("Quota: {} MB", config.cache.quota_bytes / (1024 * 1024));
    info!("High-water mark: {:.2}", config.cache.high_water_mark);
    info!("Eviction interval: {} seconds", config.eviction_interval_secs);

    let fetcher = Arc::new(HttpTileFetcher::with_timeout(Duration::from_secs(
        config.fetch_timeout_secs,
    ))?);

    // A cache that fails to open leaves the proxy running network-only
    let (coordinator, eviction) = match Cache::open(config.cache.clone()).await {
        Ok(cache) => {
            let cache = Arc::new(cache);
            let estimator = Arc::new(BlobUsageEstimator::new(
                cache.blobs().clone(),
                config.cache.quota_bytes,
            ));
            let engine = Arc::new(EvictionEngine::new(cache.clone(), estimator));
            (TileLoadCoordinator::new(cache, fetcher), Some(engine))
        }
        Err(e) => {
            warn!(error = %e, "Offline caching disabled this session");
            (TileLoadCoordinator::uncached(fetcher), None)
        }
    };

    if let Some(engine) = &eviction {
        if let Err(e) = engine.check().await {
            warn!(error = %e, "Initial eviction check failed");
        }
        spawn_eviction_task(
            engine.clone(),
            Duration::from_secs(config.eviction_interval_secs),
        );
    }

    let state: SharedState = Arc::new(ServerState::new(coordinator, eviction));

    // Start HTTP server (blocking)
    start_server(state, config.port)
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

/// Re-check storage pressure on a fixed interval
fn spawn_eviction_task(engine: Arc<EvictionEngine>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; the startup check already ran
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = engine.check().await {
                warn!(error = %e, "Periodic eviction check failed");
            }
        }
    });
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn load_config() -> Result<ProxyConfig> {
    let defaults = ProxyConfig::default();

    let high_water_mark = env_or("CACHE_HIGH_WATER", defaults.cache.high_water_mark);
    if !(high_water_mark > 0.0 && high_water_mark <= 1.0) {
        return Err(ProxyError::Config(format!(
            "CACHE_HIGH_WATER must be in (0, 1], got {}",
            high_water_mark
        )));
    }

    let cache = CacheConfig {
        root_dir: std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache.root_dir),
        version: env_or("CACHE_VERSION", defaults.cache.version),
        quota_bytes: env_or("CACHE_QUOTA_BYTES", defaults.cache.quota_bytes),
        high_water_mark,
        max_extra_passes: env_or("EVICTION_MAX_EXTRA_PASSES", defaults.cache.max_extra_passes),
    };

    Ok(ProxyConfig {
        port: env_or("PORT", defaults.port),
        cache,
        eviction_interval_secs: env_or("EVICTION_INTERVAL_SECS", defaults.eviction_interval_secs)
            .max(1),
        fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
    })
}
