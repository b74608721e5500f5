//! Offline map tile cache
//!
//! Keeps previously fetched tile images on disk keyed by their URL, tracks
//! when and how often each tile is used, and evicts by recency then frequency
//! when storage runs past a high-water mark.

mod blob_store;
mod cache;
mod coordinator;
mod error;
mod estimate;
mod eviction;
mod fetcher;
mod index;
mod locks;
mod stats;
mod types;

pub use blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use cache::Cache;
pub use coordinator::TileLoadCoordinator;
pub use error::{CacheError, Result};
pub use estimate::{BlobUsageEstimator, StorageEstimator};
pub use eviction::{select_victims, EvictionEngine, PassOutcome};
pub use fetcher::{HttpTileFetcher, TileFetcher};
pub use index::MetadataIndex;
pub use locks::KeyLocks;
pub use stats::CacheStats;
pub use types::{
    CacheConfig, EvictionReport, RecordDelta, StorageEstimate, TileOutcome, TileRecord,
};
