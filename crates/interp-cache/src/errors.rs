use stepwright_core_types::{CoreError, ErrorKind};
use thiserror::Error;

/// Durable-tier failures. Never surfaced from `resolve`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("command codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The resolver failed; nothing was cached.
    #[error("resolution failed: {0}")]
    Resolution(CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Resolution(err) if err.is_cancelled() => ErrorKind::Cancelled,
            CacheError::Resolution(_) => ErrorKind::Resolution,
            CacheError::Store(_) => ErrorKind::Storage,
        }
    }
}

impl From<CacheError> for CoreError {
    fn from(value: CacheError) -> Self {
        match value {
            CacheError::Resolution(err) if err.is_cancelled() => err,
            CacheError::Resolution(err) => CoreError::new(ErrorKind::Resolution, err.message()),
            CacheError::Store(err) => CoreError::new(ErrorKind::Storage, err.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(value: StoreError) -> Self {
        CoreError::new(ErrorKind::Storage, value.to_string())
    }
}
