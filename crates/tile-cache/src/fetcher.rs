//! Network access for tile images

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = "tile-cache-rs/0.1";

/// Fetches a tile image from its origin
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// HTTP client for fetching tiles from tile servers
pub struct HttpTileFetcher {
    client: Client,
}

impl HttpTileFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        debug!(url, "Fetching tile");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::FetchFailed(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url, "Tile server returned an error");
            return Err(CacheError::FetchFailed(format!(
                "tile server returned status {}",
                response.status()
            )));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| CacheError::FetchFailed(format!("{}: {}", url, e)))?;

        debug!(url, size = data.len(), "Fetched tile");
        Ok(data)
    }
}
