//! Error types for the connection pool.

use std::time::Duration;

use coherence_core::BackendError;
use thiserror::Error;

/// Errors surfaced by [`ConnectionPool`](crate::ConnectionPool) and the
/// connections it hands out.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The caller's wait budget ran out. Never retried internally.
    #[error("timed out after {waited:?} waiting for a connection to {key}")]
    Timeout { key: String, waited: Duration },

    #[error("connection pool is closed")]
    Closed,

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Only produced when the pool is configured to surface rollback
    /// failures instead of silently closing the broken session.
    #[error("rollback failed while releasing connection")]
    RollbackFailed(#[source] BackendError),

    #[error("read-only connection cannot run {0:?}")]
    ReadOnly(String),

    #[error("connection was already returned to the pool")]
    Released,
}

impl PoolError {
    /// Whether this is a capacity or outage failure the host should answer
    /// with backpressure ("service unavailable") rather than a generic error.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PoolError::Timeout { .. }
                | PoolError::Closed
                | PoolError::Backend(_)
                | PoolError::RollbackFailed(_)
        )
    }
}
