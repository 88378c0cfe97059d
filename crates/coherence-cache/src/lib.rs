//! coherence-cache: process-wide caching of expensive values, kept
//! coherent across processes through generation counters in the shared
//! backing store.
//!
//! Each cache id has an authoritative generation in the store. A cached value
//! is valid iff it was computed at the current generation. Invalidating an id
//! bumps its generation; every process notices the bump at the start of its
//! next unit of work and recomputes the value exactly once.

pub mod attribute;
pub mod error;
pub mod generations;
mod local;
pub mod manager;

pub use attribute::{CachedAttribute, CachedProxy, cache_id};
pub use error::CacheError;
pub use generations::GenerationTable;
pub use manager::{CacheConfig, CacheManager, CacheStats, UnitOfWork};
