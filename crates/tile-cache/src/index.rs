//! Usage index: one persisted `TileRecord` per cached tile

use crate::error::{CacheError, Result};
use crate::locks::{key_digest, KeyLocks};
use crate::types::{RecordDelta, TileRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Persistent per-tile usage records.
///
/// Mutations for a key are serialized through the shared [`KeyLocks`]; the
/// `*_held` variants assume the caller already holds the key's lock.
pub struct MetadataIndex {
    records: RwLock<HashMap<String, TileRecord>>,
    dir: PathBuf,
    locks: Arc<KeyLocks>,
}

impl MetadataIndex {
    /// Open the index stored in `dir`, loading every readable record
    pub async fn open(dir: impl Into<PathBuf>, locks: Arc<KeyLocks>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            CacheError::CacheUnavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let mut records = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .await
                .map_err(CacheError::from)
                .and_then(|raw| serde_json::from_slice::<TileRecord>(&raw).map_err(Into::into));
            match parsed {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Discarding unreadable tile record");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        info!(dir = ?dir, records = records.len(), "Metadata index opened");
        Ok(Self {
            records: RwLock::new(records),
            dir,
            locks,
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key_digest(id)))
    }

    async fn persist(&self, record: &TileRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec(record)?;

        let write = async {
            fs::write(&tmp, &raw).await?;
            fs::rename(&tmp, &path).await
        };
        write
            .await
            .map_err(|e| CacheError::IndexWriteFailed(format!("{}: {}", record.id, e)))
    }

    async fn unlink(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(CacheError::IndexWriteFailed(format!("{}: {}", id, e)))
            }
            _ => Ok(()),
        }
    }

    /// Create or refresh the record for `id`, counting one access
    pub async fn upsert(&self, id: &str, delta: RecordDelta) -> Result<TileRecord> {
        let _guard = self.locks.lock(id).await;
        self.upsert_held(id, delta, Utc::now()).await
    }

    pub(crate) async fn upsert_held(
        &self,
        id: &str,
        delta: RecordDelta,
        now: DateTime<Utc>,
    ) -> Result<TileRecord> {
        let existing = self.records.read().await.get(id).cloned();
        let used = delta.last_used.unwrap_or(now);

        let record = match existing {
            Some(mut record) => {
                // first_fetched is fixed at creation
                record.last_used = used.max(record.first_fetched);
                record.fetch_count = record.fetch_count.saturating_add(1);
                record
            }
            None => {
                let first_fetched = delta.first_fetched.unwrap_or(now);
                TileRecord {
                    id: id.to_string(),
                    first_fetched,
                    last_used: used.max(first_fetched),
                    fetch_count: 1,
                }
            }
        };

        self.persist(&record).await?;
        self.records
            .write()
            .await
            .insert(id.to_string(), record.clone());

        debug!(id, fetch_count = record.fetch_count, "Upserted tile record");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<TileRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Snapshot of every record, ordered by id
    pub async fn get_all(&self) -> Vec<TileRecord> {
        let mut all: Vec<TileRecord> = self.records.read().await.values().cloned().collect();
        all.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove the given records; absent ids are ignored
    pub async fn remove<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            let id = id.as_ref();
            let _guard = self.locks.lock(id).await;
            self.remove_held(id).await?;
        }
        Ok(())
    }

    pub(crate) async fn remove_held(&self, id: &str) -> Result<()> {
        self.unlink(id).await?;
        self.records.write().await.remove(id);
        Ok(())
    }

    /// Drop the entire index
    pub async fn destroy_all(&self) -> Result<()> {
        let mut records = self.records.write().await;
        match fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        fs::create_dir_all(&self.dir).await?;
        records.clear();
        info!(dir = ?self.dir, "Metadata index destroyed");
        Ok(())
    }
}
