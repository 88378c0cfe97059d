//! Caller-visible connection handle.
//!
//! A [`PooledConnection`] forwards statements to the pooled session and gives
//! its reference back to the pool on [`close`](PooledConnection::close) or
//! drop. The underlying session is never closed through the proxy.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;

use coherence_core::{ConnectionKey, Row, Value};
use tracing::debug;

use crate::error::PoolError;
use crate::{ConnectionPool, SharedSession};

/// Statement keywords that make a `WITH` query a write.
const MUTATING_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE"];

/// A checked-out reference to a pooled session.
///
/// Bound to the thread that acquired it: the pool tracks active sessions by
/// owning thread, so a proxy cannot be sent elsewhere.
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<coherence_pool::PooledConnection>();
/// ```
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    key: ConnectionKey,
    session: SharedSession,
    handle_id: u64,
    owner: ThreadId,
    read_only: bool,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl PooledConnection {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        key: ConnectionKey,
        session: SharedSession,
        handle_id: u64,
        owner: ThreadId,
        read_only: bool,
    ) -> Self {
        Self {
            pool,
            key,
            session,
            handle_id,
            owner,
            read_only,
            released: false,
            _not_send: PhantomData,
        }
    }

    /// Run a statement, returning the number of affected rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, PoolError> {
        self.check_usable(sql)?;
        Ok(self.session.lock().execute(sql, params)?)
    }

    /// Run a query, returning every row.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, PoolError> {
        self.check_usable(sql)?;
        Ok(self.session.lock().query(sql, params)?)
    }

    pub fn commit(&mut self) -> Result<(), PoolError> {
        if self.released {
            return Err(PoolError::Released);
        }
        if self.read_only {
            return Err(PoolError::ReadOnly("COMMIT".to_string()));
        }
        Ok(self.session.lock().commit()?)
    }

    /// Roll back the session's open transaction. Read-only proxies may share
    /// a transaction they do not own, so they cannot end it.
    pub fn rollback(&mut self) -> Result<(), PoolError> {
        if self.released {
            return Err(PoolError::Released);
        }
        if self.read_only {
            return Err(PoolError::ReadOnly("ROLLBACK".to_string()));
        }
        Ok(self.session.lock().rollback()?)
    }

    /// Return this reference to the pool. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), PoolError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.pool.release(self.owner, &self.key)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.released
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Pool-unique id of the underlying session.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Whether both proxies drive the same native session.
    pub fn same_session(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool.id()
    }

    fn check_usable(&self, sql: &str) -> Result<(), PoolError> {
        if self.released {
            return Err(PoolError::Released);
        }
        if self.read_only && !is_read_statement(sql) {
            debug!(handle = self.handle_id, key = %self.key, "rejected write on read-only connection");
            return Err(PoolError::ReadOnly(sql.trim().to_string()));
        }
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Errors were already logged by the pool; drop cannot report them.
        let _ = self.close();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("handle_id", &self.handle_id)
            .field("read_only", &self.read_only)
            .field("released", &self.released)
            .finish()
    }
}

/// `SELECT ...`, or `WITH ... SELECT` without a data-modifying clause.
fn is_read_statement(sql: &str) -> bool {
    let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let mut words = trimmed
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase);
    match words.next().as_deref() {
        Some("SELECT") => true,
        Some("WITH") => words.all(|word| !MUTATING_KEYWORDS.contains(&word.as_str())),
        _ => false,
    }
}
