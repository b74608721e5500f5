//! Core types for the tile cache proxy

use serde::{Deserialize, Serialize};
use tile_cache::{CacheConfig, CacheStats};

/// Configuration for the proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache: CacheConfig,
    pub eviction_interval_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            cache: CacheConfig::default(),
            eviction_interval_secs: 5 * 60, // 5 minutes
            fetch_timeout_secs: 30,
        }
    }
}

/// Query string of a tile request
#[derive(Debug, Deserialize)]
pub struct TileQuery {
    pub url: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub caching_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    pub cache: CacheStats,
}

/// Guess an image content type from the leading bytes of a tile
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 3002);
        assert_eq!(config.cache.root_dir, PathBuf::from("./cache/tiles"));
        assert_eq!(config.eviction_interval_secs, 300);
        assert_eq!(config.fetch_timeout_secs, 30);
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(sniff_content_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(b"GIF89a"), "image/gif");
        assert_eq!(sniff_content_type(b"tile"), "application/octet-stream");
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 3600,
            caching_enabled: false,
            notice: Some("offline caching disabled this session".to_string()),
            cache: CacheStats {
                entries: 100,
                hits: 500,
                ..CacheStats::default()
            },
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"caching_enabled\":false"));
        assert!(json.contains("offline caching disabled"));
        assert!(json.contains("500"));
    }

    #[test]
    fn test_health_response_omits_empty_notice() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 1,
            caching_enabled: true,
            notice: None,
            cache: CacheStats::default(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("notice"));
    }
}
