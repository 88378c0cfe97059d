//! Thread-local "current transaction" register.
//!
//! [`ConnectionPool::begin_transaction`] pushes a frame for `(pool, key)` on
//! the calling thread. A second `begin_transaction` for the same pair on the
//! same thread joins the outer one: it gets the same session (through the
//! pool's re-entrant checkout) and leaves commit and rollback to the
//! outermost transaction.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use coherence_core::ConnectionKey;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::proxy::PooledConnection;
use crate::ConnectionPool;

struct Frame {
    pool_id: u64,
    key: ConnectionKey,
}

thread_local! {
    static REGISTER: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

fn push_frame(pool_id: u64, key: &ConnectionKey) {
    REGISTER.with(|register| {
        register.borrow_mut().push(Frame {
            pool_id,
            key: key.clone(),
        })
    });
}

fn pop_frame(pool_id: u64, key: &ConnectionKey) {
    REGISTER.with(|register| {
        let mut frames = register.borrow_mut();
        if let Some(pos) = frames
            .iter()
            .rposition(|frame| frame.pool_id == pool_id && frame.key == *key)
        {
            frames.remove(pos);
        }
    });
}

fn has_frame(pool_id: u64, key: &ConnectionKey) -> bool {
    REGISTER.with(|register| {
        register
            .borrow()
            .iter()
            .any(|frame| frame.pool_id == pool_id && frame.key == *key)
    })
}

/// A write transaction on a pooled connection.
///
/// Dereferences to the [`PooledConnection`] it runs on. Dropping an
/// unfinished outermost transaction rolls it back.
///
/// The register frame lives on the thread that began the transaction, so a
/// transaction must be finished there:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<coherence_pool::Transaction>();
/// ```
pub struct Transaction {
    conn: PooledConnection,
    outermost: bool,
    finished: bool,
}

impl Transaction {
    /// Whether this transaction owns the commit (it is not nested).
    pub fn is_outermost(&self) -> bool {
        self.outermost
    }

    /// Commit if outermost; a nested transaction only releases its reference.
    pub fn commit(mut self) -> Result<(), PoolError> {
        self.finished = true;
        if self.outermost {
            pop_frame(self.conn.pool_id(), self.conn.key());
            self.conn.commit()?;
            debug!(key = %self.conn.key(), handle = self.conn.handle_id(), "transaction committed");
        }
        self.conn.close()
    }

    /// Roll back if outermost; a nested transaction only releases its reference.
    pub fn rollback(mut self) -> Result<(), PoolError> {
        self.finished = true;
        if self.outermost {
            pop_frame(self.conn.pool_id(), self.conn.key());
            self.conn.rollback()?;
            debug!(key = %self.conn.key(), handle = self.conn.handle_id(), "transaction rolled back");
        }
        self.conn.close()
    }
}

impl Deref for Transaction {
    type Target = PooledConnection;

    fn deref(&self) -> &PooledConnection {
        &self.conn
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut PooledConnection {
        &mut self.conn
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished || !self.outermost {
            return;
        }
        pop_frame(self.conn.pool_id(), self.conn.key());
        if let Err(err) = self.conn.rollback() {
            warn!(key = %self.conn.key(), error = %err, "rollback of abandoned transaction failed");
        }
    }
}

impl ConnectionPool {
    /// Start a transaction on `key`, joining the calling thread's open
    /// transaction for the same key if there is one.
    pub fn begin_transaction(self: &Arc<Self>, key: &ConnectionKey) -> Result<Transaction, PoolError> {
        let outermost = !self.in_transaction(key);
        let conn = self.connection(key)?;
        if outermost {
            push_frame(self.id(), key);
        }
        debug!(key = %key, handle = conn.handle_id(), outermost, "transaction started");
        Ok(Transaction {
            conn,
            outermost,
            finished: false,
        })
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_transaction<T, E, F>(self: &Arc<Self>, key: &ConnectionKey, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut PooledConnection) -> Result<T, E>,
        E: From<PoolError>,
    {
        let mut txn = self.begin_transaction(key)?;
        match f(&mut *txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback() {
                    warn!(key = %key, error = %rollback_err, "rollback after failed transaction body failed");
                }
                Err(err)
            }
        }
    }

    /// Whether the calling thread has an open transaction on `key` in this pool.
    pub fn in_transaction(&self, key: &ConnectionKey) -> bool {
        has_frame(self.id(), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn commit_commits_and_releases() {
        let (pool, probe) = make_pool(test_config(2));
        let mut txn = pool.begin_transaction(&key("db")).unwrap();
        assert!(txn.is_outermost());
        assert!(pool.in_transaction(&key("db")));
        txn.execute("UPDATE t SET x = 1", &[]).unwrap();
        txn.commit().unwrap();

        assert!(!pool.in_transaction(&key("db")));
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats(&key("db")).idle, 1);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (pool, probe) = make_pool(test_config(2));
        {
            let mut txn = pool.begin_transaction(&key("db")).unwrap();
            txn.execute("UPDATE t SET x = 1", &[]).unwrap();
        }
        assert!(!pool.in_transaction(&key("db")));
        assert_eq!(probe.commits.load(Ordering::SeqCst), 0);
        // One explicit rollback plus the release rollback.
        assert_eq!(probe.rollbacks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_transaction_joins_outer() {
        let (pool, probe) = make_pool(test_config(2));
        let outer = pool.begin_transaction(&key("db")).unwrap();
        let inner = pool.begin_transaction(&key("db")).unwrap();
        assert!(!inner.is_outermost());
        assert!(inner.same_session(&outer));

        inner.commit().unwrap();
        assert_eq!(probe.commits.load(Ordering::SeqCst), 0, "nested commit is deferred");
        assert!(pool.in_transaction(&key("db")));

        outer.commit().unwrap();
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
        assert_eq!(probe.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_connection_inside_transaction_shares_session() {
        let (pool, _) = make_pool(test_config(2));
        let txn = pool.begin_transaction(&key("db")).unwrap();
        let read = pool.read_connection(&key("db")).unwrap();
        assert!(read.same_session(&txn));
        assert!(read.is_read_only());
    }

    #[test]
    fn with_transaction_commits_on_ok() {
        let (pool, probe) = make_pool(test_config(2));
        let rows = pool
            .with_transaction(&key("db"), |conn| conn.execute("INSERT INTO t VALUES (1)", &[]))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_transaction_rolls_back_on_err() {
        let (pool, probe) = make_pool(test_config(2));
        let result: Result<(), PoolError> = pool.with_transaction(&key("db"), |conn| {
            conn.execute("INSERT INTO t VALUES (1)", &[])?;
            Err(PoolError::ReadOnly("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(probe.commits.load(Ordering::SeqCst), 0);
        assert!(!pool.in_transaction(&key("db")));
    }

    #[test]
    fn register_is_per_pool() {
        let (first, _) = make_pool(test_config(2));
        let (second, _) = make_pool(test_config(2));
        let _txn = first.begin_transaction(&key("db")).unwrap();
        assert!(first.in_transaction(&key("db")));
        assert!(!second.in_transaction(&key("db")));
    }

    #[test]
    fn register_is_per_thread() {
        let (pool, _) = make_pool(test_config(2));
        let _txn = pool.begin_transaction(&key("db")).unwrap();
        let seen = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.in_transaction(&key("db")))
                .join()
                .unwrap()
        };
        assert!(!seen);
    }

    #[test]
    fn next_transaction_after_commit_is_outermost() {
        let (pool, probe) = make_pool(test_config(2));
        let first = pool.begin_transaction(&key("db")).unwrap();
        first.commit().unwrap();

        let mut second = pool.begin_transaction(&key("db")).unwrap();
        assert!(second.is_outermost());
        second.execute("UPDATE t SET x = 2", &[]).unwrap();
        second.commit().unwrap();
        assert_eq!(probe.commits.load(Ordering::SeqCst), 2);
        assert!(!pool.in_transaction(&key("db")));
    }
}
