//! Cache types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Usage record for one cached tile, keyed by its URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileRecord {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub first_fetched: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_used: DateTime<Utc>,
    pub fetch_count: u64,
}

/// Optional fields supplied with an upsert.
///
/// An empty delta is the hit-path update: it refreshes recency and counts the
/// access but never touches `first_fetched`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordDelta {
    pub first_fetched: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl RecordDelta {
    /// Delta recorded after a fresh fetch-and-store
    pub fn fetched_at(now: DateTime<Utc>) -> Self {
        Self {
            first_fetched: Some(now),
            last_used: Some(now),
        }
    }
}

/// Platform storage estimate, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

impl StorageEstimate {
    /// Fraction of quota in use; an unknown (zero) quota reads as empty
    pub fn fill_ratio(&self) -> f64 {
        if self.quota == 0 {
            return 0.0;
        }
        self.usage as f64 / self.quota as f64
    }

    pub fn is_at_or_above(&self, high_water_mark: f64) -> bool {
        self.quota > 0 && self.fill_ratio() >= high_water_mark
    }
}

/// How a tile request was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileOutcome {
    /// Served from the blob store
    Hit(Bytes),
    /// Fetched from the network and stored
    Fetched(Bytes),
    /// Fetched from the network without touching the cache
    Bypassed(Bytes),
    /// Nothing could be fetched; the surface should load the URL itself
    Direct(String),
}

impl TileOutcome {
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            TileOutcome::Hit(bytes)
            | TileOutcome::Fetched(bytes)
            | TileOutcome::Bypassed(bytes) => Some(bytes),
            TileOutcome::Direct(_) => None,
        }
    }

    /// Whether the tile was resolved through the cache
    pub fn is_served(&self) -> bool {
        matches!(self, TileOutcome::Hit(_) | TileOutcome::Fetched(_))
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root_dir: PathBuf,
    /// Namespace version; bumping it starts an empty cache
    pub version: u32,
    pub quota_bytes: u64,
    /// Fraction of quota at which eviction kicks in
    pub high_water_mark: f64,
    /// Extra passes allowed when pressure persists after a pass
    pub max_extra_passes: u32,
}

impl CacheConfig {
    pub fn namespace(&self) -> String {
        format!("map-terrain-{}", self.version)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join(self.namespace())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./cache/tiles"),
            version: 1,
            quota_bytes: 512 * 1024 * 1024, // 512MB
            high_water_mark: 2.0 / 3.0,
            max_extra_passes: 1,
        }
    }
}

/// Outcome of one eviction check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvictionReport {
    pub triggered: bool,
    pub passes: u32,
    pub selected: usize,
    pub evicted: usize,
    pub failed: usize,
    /// Victims touched between snapshot and delete, left in place
    pub skipped: usize,
    pub before: StorageEstimate,
    pub after: StorageEstimate,
    pub pressure_persists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.version, 1);
        assert_eq!(config.namespace(), "map-terrain-1");
        assert_eq!(config.cache_dir(), PathBuf::from("./cache/tiles/map-terrain-1"));
        assert_eq!(config.max_extra_passes, 1);
        assert!((config.high_water_mark - 0.6667).abs() < 0.001);
    }

    #[test]
    fn test_tile_record_serialization() {
        let record = TileRecord {
            id: "https://tiles.example/256/3/2/1/png".to_string(),
            first_fetched: Utc.timestamp_millis_opt(1645293015978).unwrap(),
            last_used: Utc.timestamp_millis_opt(1645301373131).unwrap(),
            fetch_count: 4,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"firstFetched\":1645293015978"));
        assert!(json.contains("\"lastUsed\":1645301373131"));
        assert!(json.contains("\"fetchCount\":4"));

        let deserialized: TileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, record);
    }

    #[test]
    fn test_storage_estimate_high_water() {
        let estimate = StorageEstimate {
            usage: 200,
            quota: 300,
        };
        assert!(estimate.is_at_or_above(2.0 / 3.0));

        let estimate = StorageEstimate {
            usage: 199,
            quota: 300,
        };
        assert!(!estimate.is_at_or_above(2.0 / 3.0));

        let unknown = StorageEstimate { usage: 10, quota: 0 };
        assert!(!unknown.is_at_or_above(0.5));
    }

    #[test]
    fn test_tile_outcome_bytes() {
        let hit = TileOutcome::Hit(Bytes::from_static(b"png"));
        assert!(hit.is_served());
        assert_eq!(hit.bytes().unwrap().as_ref(), b"png");

        let direct = TileOutcome::Direct("https://tiles.example/a".to_string());
        assert!(!direct.is_served());
        assert!(direct.bytes().is_none());

        let bypassed = TileOutcome::Bypassed(Bytes::from_static(b"png"));
        assert!(!bypassed.is_served());
        assert!(bypassed.bytes().is_some());
    }
}
