//! Storage pressure estimates

use crate::blob_store::BlobStore;
use crate::error::Result;
use crate::types::StorageEstimate;
use async_trait::async_trait;
use std::sync::Arc;

/// Reports how much of the storage quota is in use
#[async_trait]
pub trait StorageEstimator: Send + Sync {
    async fn estimate(&self) -> Result<StorageEstimate>;
}

/// Measures blob bytes on disk against a fixed quota
pub struct BlobUsageEstimator {
    blobs: Arc<dyn BlobStore>,
    quota: u64,
}

impl BlobUsageEstimator {
    pub fn new(blobs: Arc<dyn BlobStore>, quota: u64) -> Self {
        Self { blobs, quota }
    }
}

#[async_trait]
impl StorageEstimator for BlobUsageEstimator {
    async fn estimate(&self) -> Result<StorageEstimate> {
        Ok(StorageEstimate {
            usage: self.blobs.usage_bytes().await?,
            quota: self.quota,
        })
    }
}
