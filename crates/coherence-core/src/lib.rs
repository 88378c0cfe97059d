//! coherence-core: shared types for the connection pool and the
//! generation-counter cache.
//!
//! - **key**: connection parameters and the pooling key derived from them
//! - **session**: the `Session` / `Connector` capabilities a backing store provides
//! - **error**: opaque backend errors and key parsing errors
//! - **config**: `coherence.toml` parsing

pub mod config;
pub mod error;
pub mod key;
pub mod session;

pub use config::{CacheSettings, CoherenceConfig, DatabaseConfig, PoolSettings};
pub use error::{BackendError, KeyError};
pub use key::{Backend, ConnectionKey, ConnectionParams};
pub use session::{Connector, Row, Session, Value};
