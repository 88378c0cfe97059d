//! Generation-counter cache manager.
//!
//! # Architecture
//!
//! ```text
//! get(id, retriever)
//!   → no snapshot on this thread     → read the whole generation table once,
//!                                      freeze it for the unit of work
//!   → local copy matches snapshot    → return it (no query)
//!   → lock the manager
//!     → process value matches snapshot            → adopt it
//!     → re-read the row for id, process value matches → adopt it
//!     → otherwise                                 → run retriever, store in both tiers
//!
//! invalidate(id)
//!   → lock the manager, UPDATE generation + 1 (INSERT at 1 if no row)
//!   → drop id from the process cache and this thread's local copy
//! ```
//!
//! Other processes see an invalidation when their next unit of work takes a
//! fresh snapshot.

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use coherence_core::{CacheSettings, ConnectionKey};
use coherence_pool::{ConnectionPool, PooledConnection};
use parking_lot::ReentrantMutex;
use tracing::{debug, info};

use crate::error::{CacheError, Result};
use crate::generations::GenerationTable;
use crate::local::{self, CachedValue};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Generation table name (default: `cache`).
    pub table: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            table: settings.table.clone(),
        }
    }
}

/// Counters since the manager was created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from the calling thread's local copy.
    pub local_hits: u64,
    /// Adopted from the process-wide cache.
    pub shared_hits: u64,
    /// Retriever invocations that succeeded.
    pub recomputes: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    recomputes: AtomicU64,
    invalidations: AtomicU64,
}

/// Process-wide cache of expensive values, kept coherent across processes
/// through the generation table.
///
/// Construct one per (application, store) at startup and share it by
/// reference or `Arc`.
pub struct CacheManager {
    id: u64,
    pool: Arc<ConnectionPool>,
    key: ConnectionKey,
    table: GenerationTable,
    /// Process-wide values. Re-entrant so a retriever may read other ids.
    entries: ReentrantMutex<RefCell<HashMap<String, CachedValue>>>,
    counters: Counters,
}

impl CacheManager {
    pub fn new(pool: Arc<ConnectionPool>, key: ConnectionKey, config: CacheConfig) -> Result<Self> {
        let table = GenerationTable::new(&config.table)?;
        Ok(Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            key,
            table,
            entries: ReentrantMutex::new(RefCell::new(HashMap::new())),
            counters: Counters::default(),
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn table(&self) -> &GenerationTable {
        &self.table
    }

    /// Create the generation table if it does not exist.
    pub fn ensure_schema(&self) -> Result<()> {
        self.pool
            .with_transaction(&self.key, |conn| self.table.ensure_schema(conn))?;
        info!(table = self.table.name(), key = %self.key, "generation table ready");
        Ok(())
    }

    /// The value cached under `id`, computing it with `retriever` when stale.
    ///
    /// A read-only connection is borrowed only when the calling thread's
    /// local copy cannot answer.
    pub fn get<T, F>(&self, id: &str, retriever: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&mut PooledConnection) -> anyhow::Result<T>,
    {
        if let Some(entry) = local::lookup(self.id, id) {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            return downcast(id, entry.value);
        }
        let mut conn = self.pool.read_connection(&self.key)?;
        self.get_with(id, &mut conn, retriever)
    }

    /// [`get`](Self::get) on a connection the caller already holds.
    pub fn get_with<T, F>(&self, id: &str, conn: &mut PooledConnection, retriever: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&mut PooledConnection) -> anyhow::Result<T>,
    {
        if !local::has_view(self.id) {
            self.take_snapshot(conn)?;
        }
        if let Some(entry) = local::lookup(self.id, id) {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            return downcast(id, entry.value);
        }

        let guard = self.entries.lock();
        let shared = guard.borrow().get(id).cloned();

        // Another thread may have refreshed the value since the snapshot.
        let expected = local::snapshot_generation(self.id, id);
        if let Some(entry) = shared.as_ref().filter(|entry| entry.generation == expected) {
            return self.adopt(id, entry.clone());
        }

        // The snapshot itself may be outdated: ask the store for this id only.
        let current = self.table.read_one(conn, id)?;
        if let Some(entry) = shared.filter(|entry| entry.generation == current) {
            return self.adopt(id, entry);
        }

        let value = Arc::new(retriever(conn).map_err(|source| CacheError::Retriever {
            id: id.to_string(),
            source,
        })?);
        let entry = CachedValue {
            value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            generation: current,
        };
        guard.borrow_mut().insert(id.to_string(), entry.clone());
        local::store(self.id, id, entry);
        drop(guard);

        self.counters.recomputes.fetch_add(1, Ordering::Relaxed);
        debug!(cache_id = id, generation = current, "recomputed cached value");
        Ok(value)
    }

    fn take_snapshot(&self, conn: &mut PooledConnection) -> Result<()> {
        let snapshot = self.table.read_all(conn)?;
        let values = self.entries.lock().borrow().clone();
        debug!(
            manager = self.id,
            ids = snapshot.len(),
            cached = values.len(),
            "took generation snapshot"
        );
        local::install(self.id, snapshot, values);
        Ok(())
    }

    fn adopt<T: Any + Send + Sync>(&self, id: &str, entry: CachedValue) -> Result<Arc<T>> {
        self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
        debug!(cache_id = id, generation = entry.generation, "adopted process-wide value");
        let value = entry.value.clone();
        local::store(self.id, id, entry);
        downcast(id, value)
    }

    /// Advance the generation of `id` in its own transaction (or the calling
    /// thread's open one on the same key). Returns the new generation.
    pub fn invalidate(&self, id: &str) -> Result<i64> {
        self.pool
            .with_transaction(&self.key, |conn| self.invalidate_with(id, conn))
    }

    /// [`invalidate`](Self::invalidate) on the caller's connection. The new
    /// generation becomes visible to others when the caller commits.
    pub fn invalidate_with(&self, id: &str, conn: &mut PooledConnection) -> Result<i64> {
        let guard = self.entries.lock();
        let generation = self.table.bump(conn, id)?;
        guard.borrow_mut().remove(id);
        local::forget(self.id, id);
        drop(guard);

        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        info!(cache_id = id, generation, "invalidated cached value");
        Ok(generation)
    }

    /// Drop the calling thread's snapshot and local copy. The next `get`
    /// takes a fresh snapshot.
    pub fn reset_unit_of_work(&self) {
        local::reset(self.id);
    }

    /// Scope a unit of work: resets the thread's view now and on drop.
    pub fn begin_unit_of_work(&self) -> UnitOfWork<'_> {
        self.reset_unit_of_work();
        UnitOfWork { manager: self }
    }

    /// Every authoritative `(id, generation)` row, sorted by id.
    pub fn generations(&self) -> Result<BTreeMap<String, i64>> {
        let mut conn = self.pool.read_connection(&self.key)?;
        Ok(self.table.read_all(&mut conn)?.into_iter().collect())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            recomputes: self.counters.recomputes.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("table", &self.table.name())
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`CacheManager::begin_unit_of_work`].
pub struct UnitOfWork<'a> {
    manager: &'a CacheManager,
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        self.manager.reset_unit_of_work();
    }
}

fn downcast<T: Any + Send + Sync>(id: &str, value: Arc<dyn Any + Send + Sync>) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| CacheError::TypeMismatch {
        id: id.to_string(),
        expected: type_name::<T>(),
    })
}
