//! Error taxonomy for the tile cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    /// The backing store is missing or broken; caching stays off for the session.
    CacheUnavailable(String),
    /// The network fetch of a tile failed.
    FetchFailed(String),
    /// A blob write failed after a successful fetch.
    StoreWriteFailed(String),
    /// A usage record could not be written.
    IndexWriteFailed(String),
    /// Some victims of an eviction pass could not be deleted.
    EvictionPartialFailure { failed: usize, attempted: usize },
    Io(Box<std::io::Error>),
    Serialization(Box<serde_json::Error>),
    Http(Box<reqwest::Error>),
    Config(String),
}

impl CacheError {
    /// Whether this error should switch caching off for the rest of the session
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::CacheUnavailable(_))
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::CacheUnavailable(msg) => write!(f, "Cache unavailable: {}", msg),
            CacheError::FetchFailed(msg) => write!(f, "Fetch failed: {}", msg),
            CacheError::StoreWriteFailed(msg) => write!(f, "Store write failed: {}", msg),
            CacheError::IndexWriteFailed(msg) => write!(f, "Index write failed: {}", msg),
            CacheError::EvictionPartialFailure { failed, attempted } => write!(
                f,
                "Eviction partially failed: {} of {} deletions failed",
                failed, attempted
            ),
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Serialization(err) => write!(f, "Serialization error: {}", err),
            CacheError::Http(err) => write!(f, "HTTP error: {}", err),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            CacheError::Serialization(err) => Some(err.as_ref()),
            CacheError::Http(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(Box::new(err))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Http(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
