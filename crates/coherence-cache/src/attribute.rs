//! Named bindings of a retriever to a cache id.
//!
//! An owner (say, a wiki system component) stores a [`CachedAttribute`] as a
//! field. The cache id is `"{owner_type}.{property}"`, so every instance of
//! the owner type in every process shares one generation counter.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use coherence_pool::PooledConnection;

use crate::error::Result;
use crate::manager::CacheManager;

type Retriever<T> = Arc<dyn Fn(&mut PooledConnection) -> anyhow::Result<T> + Send + Sync>;

/// Cache id for `property` of `owner_type`.
pub fn cache_id(owner_type: &str, property: &str) -> String {
    format!("{owner_type}.{property}")
}

/// Unqualified name of `O`, e.g. `WikiSystem` for `app::wiki::WikiSystem`.
fn short_type_name<O: ?Sized>() -> &'static str {
    let full = type_name::<O>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// Read-mostly attribute: `get()` borrows its own connection.
pub struct CachedAttribute<T> {
    manager: Arc<CacheManager>,
    id: String,
    retriever: Retriever<T>,
}

impl<T: Any + Send + Sync> CachedAttribute<T> {
    pub fn new<F>(manager: Arc<CacheManager>, owner_type: &str, property: &str, retriever: F) -> Self
    where
        F: Fn(&mut PooledConnection) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            manager,
            id: cache_id(owner_type, property),
            retriever: Arc::new(retriever),
        }
    }

    /// Bind using the unqualified type name of `O` as the owner type.
    pub fn for_owner<O: ?Sized, F>(manager: Arc<CacheManager>, property: &str, retriever: F) -> Self
    where
        F: Fn(&mut PooledConnection) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::new(manager, short_type_name::<O>(), property, retriever)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self) -> Result<Arc<T>> {
        let retriever = &self.retriever;
        self.manager.get(&self.id, |conn| retriever(conn))
    }

    /// Invalidate in a transaction of its own (or the thread's open one).
    pub fn invalidate(&self) -> Result<i64> {
        self.manager.invalidate(&self.id)
    }

    /// The explicit-connection variant of this attribute.
    pub fn proxy(&self) -> CachedProxy<T> {
        CachedProxy {
            manager: Arc::clone(&self.manager),
            id: self.id.clone(),
            retriever: Arc::clone(&self.retriever),
        }
    }
}

/// Attribute whose reads and invalidations run on a caller's connection, so
/// an invalidation only takes effect if the caller's transaction commits.
pub struct CachedProxy<T> {
    manager: Arc<CacheManager>,
    id: String,
    retriever: Retriever<T>,
}

impl<T: Any + Send + Sync> CachedProxy<T> {
    pub fn new<F>(manager: Arc<CacheManager>, owner_type: &str, property: &str, retriever: F) -> Self
    where
        F: Fn(&mut PooledConnection) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            manager,
            id: cache_id(owner_type, property),
            retriever: Arc::new(retriever),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, conn: &mut PooledConnection) -> Result<Arc<T>> {
        let retriever = &self.retriever;
        self.manager.get_with(&self.id, conn, |conn| retriever(conn))
    }

    pub fn invalidate(&self, conn: &mut PooledConnection) -> Result<i64> {
        self.manager.invalidate_with(&self.id, conn)
    }
}

impl<T> Clone for CachedAttribute<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            id: self.id.clone(),
            retriever: Arc::clone(&self.retriever),
        }
    }
}

impl<T> Clone for CachedProxy<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            id: self.id.clone(),
            retriever: Arc::clone(&self.retriever),
        }
    }
}

impl<T> fmt::Debug for CachedAttribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAttribute").field("id", &self.id).finish()
    }
}

impl<T> fmt::Debug for CachedProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedProxy").field("id", &self.id).finish()
    }
}
