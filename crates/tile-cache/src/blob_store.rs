//! Tile image storage keyed by request URL

use crate::error::{CacheError, Result};
use crate::locks::key_digest;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const BLOB_EXT: &str = "blob";
const KEY_EXT: &str = "url";

/// Persistent URL to bytes store holding the tile images themselves
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<Bytes>>;

    async fn put(&self, url: &str, data: Bytes) -> Result<()>;

    /// Remove a blob; removing an absent key is not an error
    async fn delete(&self, url: &str) -> Result<()>;

    async fn list_keys(&self) -> Result<BTreeSet<String>>;

    /// Drop every blob
    async fn clear(&self) -> Result<()>;

    /// Bytes currently held
    async fn usage_bytes(&self) -> Result<u64>;
}

/// Blob store backed by a directory: `<sha256>.blob` holds the bytes and
/// `<sha256>.url` the key they were stored under.
pub struct FsBlobStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// Fails with `CacheUnavailable` when the directory cannot be created or
    /// written to.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            CacheError::CacheUnavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let probe = dir.join(".probe");
        fs::write(&probe, b"ok").await.map_err(|e| {
            CacheError::CacheUnavailable(format!("cannot write to {}: {}", dir.display(), e))
        })?;
        let _ = fs::remove_file(&probe).await;

        info!(dir = ?dir, "Blob store opened");
        Ok(Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", digest, BLOB_EXT))
    }

    fn key_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", digest, KEY_EXT))
    }

    async fn remove_if_present(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, url: &str) -> Result<Option<Bytes>> {
        let path = self.blob_path(&key_digest(url));
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, url: &str, data: Bytes) -> Result<()> {
        let digest = key_digest(url);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!("{}.{}.tmp", digest, seq));

        let write = async {
            fs::write(self.key_path(&digest), url.as_bytes()).await?;
            fs::write(&tmp, &data).await?;
            fs::rename(&tmp, self.blob_path(&digest)).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::StoreWriteFailed(format!("{}: {}", url, e)));
        }

        debug!(url, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let digest = key_digest(url);
        Self::remove_if_present(&self.blob_path(&digest)).await?;
        Self::remove_if_present(&self.key_path(&digest)).await?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXT) {
                continue;
            }
            if !fs::try_exists(path.with_extension(BLOB_EXT)).await? {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(url) => {
                    keys.insert(url);
                }
                Err(e) => warn!(path = ?path, error = %e, "Unreadable blob key file"),
            }
        }

        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        fs::create_dir_all(&self.dir).await?;
        info!(dir = ?self.dir, "Blob store cleared");
        Ok(())
    }

    async fn usage_bytes(&self) -> Result<u64> {
        let mut total = 0;
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(BLOB_EXT) {
                total += entry.metadata().await?.len();
            }
        }

        Ok(total)
    }
}

/// In-process blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, url: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().await.get(url).cloned())
    }

    async fn put(&self, url: &str, data: Bytes) -> Result<()> {
        self.blobs.write().await.insert(url.to_string(), data);
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.blobs.write().await.remove(url);
        Ok(())
    }

    async fn list_keys(&self) -> Result<BTreeSet<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.blobs.write().await.clear();
        Ok(())
    }

    async fn usage_bytes(&self) -> Result<u64> {
        Ok(self
            .blobs
            .read()
            .await
            .values()
            .map(|b| b.len() as u64)
            .sum())
    }
}
