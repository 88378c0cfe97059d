//! Error types for the cache manager.

use coherence_core::BackendError;
use coherence_pool::PoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("generation table: {0}")]
    Backend(#[from] BackendError),

    /// The retriever failed; nothing was cached for `id`.
    #[error("retriever for cache id {id:?} failed")]
    Retriever {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache id {id:?} holds a value of a different type than {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    #[error("invalid cache table name {0:?}")]
    InvalidTable(String),

    #[error("malformed generation row: {0}")]
    MalformedRow(String),
}

impl CacheError {
    /// Whether the failure is pool exhaustion or a backend outage.
    pub fn is_unavailable(&self) -> bool {
        match self {
            CacheError::Pool(err) => err.is_unavailable(),
            CacheError::Backend(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
