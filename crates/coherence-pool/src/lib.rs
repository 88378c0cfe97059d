//! coherence-pool: bounded, thread-keyed connection pool.
//!
//! Sessions are pooled per [`ConnectionKey`] under one capacity bound shared
//! by every key. Callers only ever hold [`PooledConnection`] proxies; the
//! pool exclusively owns the sessions behind them.
//!
//! # Architecture
//!
//! ```text
//! acquire(key, timeout)
//!   → thread already holds an active handle for key → reuse it (re-entrant)
//!   → idle handle for key exists                    → probe, mark active
//!   → active + idle < max_size                      → open a new session
//!   → thread within its fair share, any key idle    → close the LRU one, open
//!   → otherwise                                     → wait on the condvar (timeout)
//!
//! PooledConnection::close()  (or drop)
//!   → reuse count reaches zero → rollback
//!     → rollback failed  → close, slot freed
//!     → poolable         → push to idle (timestamped)
//!     → not poolable     → close
//!   → wake a waiter
//! ```
//!
//! Native opens, rollbacks and closes happen outside the pool mutex. Slots in
//! transition are counted as `reserved`, so `active + idle + reserved` never
//! exceeds `max_size`.

pub mod error;
pub mod proxy;
pub mod sqlite;
pub mod transaction;

pub use error::PoolError;
pub use proxy::PooledConnection;
pub use sqlite::{SqliteConnector, SqliteSession};
pub use transaction::Transaction;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use coherence_core::{ConnectionKey, Connector, PoolSettings, Session};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

/// A native session shared between the pool's bookkeeping and the proxies
/// of its owning thread.
pub(crate) type SharedSession = Arc<Mutex<Box<dyn Session>>>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a [`ConnectionPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum sessions (idle + active) across all keys (default: 10).
    pub max_size: usize,
    /// Wait budget used by [`ConnectionPool::connection`] (default: 20s).
    pub acquire_timeout: Duration,
    /// Idle age past which [`ConnectionPool::reclaim_expired`] closes a session (default: 30s).
    pub idle_max_age: Duration,
    /// Ping idle sessions before handing them out (default: true).
    pub probe_on_checkout: bool,
    /// Report rollback failures at release instead of only closing the
    /// session (default: false).
    pub surface_rollback_failures: bool,
    /// How long [`ConnectionPool::shutdown`] waits for active sessions (default: 5s).
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_size: settings.max_size.max(1),
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            idle_max_age: Duration::from_secs(settings.idle_max_age_secs),
            probe_on_checkout: settings.probe_on_checkout,
            surface_rollback_failures: settings.surface_rollback_failures,
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
        }
    }
}

/// One live session plus its pooling metadata.
struct ConnectionHandle {
    id: u64,
    key: ConnectionKey,
    session: SharedSession,
    poolable: bool,
    created_at: Instant,
}

impl ConnectionHandle {
    fn close(&self) {
        self.session.lock().close();
        debug!(
            handle = self.id,
            key = %self.key,
            age_ms = self.created_at.elapsed().as_millis() as u64,
            "closed connection"
        );
    }
}

struct ActiveHandle {
    handle: ConnectionHandle,
    /// Number of outstanding proxies on the owning thread.
    reuse: usize,
}

struct IdleHandle {
    handle: ConnectionHandle,
    returned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Idle handles, least recently returned first.
    idle: VecDeque<IdleHandle>,
    /// Checked-out handles keyed by (owning thread, key).
    active: HashMap<(ThreadId, ConnectionKey), ActiveHandle>,
    /// Slots held by opens and rollbacks running outside the mutex.
    reserved: usize,
    closed: bool,
    wait_counts: HashMap<ConnectionKey, u64>,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.reserved
    }

    /// Whether `owner` holds fewer active handles than an even split of
    /// `max_size` among the threads holding handles (itself included).
    fn within_fair_share(&self, owner: ThreadId, max_size: usize) -> bool {
        let mut owners: HashSet<ThreadId> = self.active.keys().map(|(thread, _)| *thread).collect();
        owners.insert(owner);
        let held = self.active.keys().filter(|(thread, _)| *thread == owner).count();
        held < max_size.div_ceil(owners.len())
    }
}

/// Pool-level statistics for a single key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles currently checked out (one per owning thread).
    pub active: usize,
    /// Handles sitting idle in the pool.
    pub idle: usize,
    /// Total handles (active + idle).
    pub total: usize,
    /// Number of acquisitions that had to wait for a slot.
    pub wait_count: u64,
}

/// Process-wide pool of store sessions.
///
/// Construct once at startup and share by `Arc`; every proxy keeps the pool
/// alive until it is released.
pub struct ConnectionPool {
    id: u64,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot frees up or the pool closes.
    available: Condvar,
    next_handle: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool that opens sessions through `connector`.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let config = PoolConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Acquire a connection for `key`, waiting at most `timeout` for a free
    /// slot. `None` waits without bound.
    pub fn acquire(
        self: &Arc<Self>,
        key: &ConnectionKey,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection, PoolError> {
        self.checkout(key, timeout, false)
    }

    /// Acquire a connection using the configured `acquire_timeout`.
    pub fn connection(self: &Arc<Self>, key: &ConnectionKey) -> Result<PooledConnection, PoolError> {
        self.checkout(key, Some(self.config.acquire_timeout), false)
    }

    /// Acquire a read-only connection using the configured `acquire_timeout`.
    ///
    /// Inside a transaction on the same thread this is the transaction's own
    /// session, so reads observe its uncommitted writes.
    pub fn read_connection(
        self: &Arc<Self>,
        key: &ConnectionKey,
    ) -> Result<PooledConnection, PoolError> {
        self.checkout(key, Some(self.config.acquire_timeout), true)
    }

    fn checkout(
        self: &Arc<Self>,
        key: &ConnectionKey,
        timeout: Option<Duration>,
        read_only: bool,
    ) -> Result<PooledConnection, PoolError> {
        let owner = thread::current().id();
        let slot = (owner, key.clone());
        let started = Instant::now();
        let deadline = timeout.map(|limit| started + limit);
        let mut waited = false;

        let mut state = self.state.lock();
        let evicted = loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            // First choice: the handle this thread already holds for the key.
            if let Some(active) = state.active.get_mut(&slot) {
                active.reuse += 1;
                debug!(
                    handle = active.handle.id,
                    key = %key,
                    reuse = active.reuse,
                    "re-entered active connection"
                );
                return Ok(self.proxy(&active.handle, owner, read_only));
            }

            // Second choice: an idle handle for the key, most recently returned first.
            if let Some(pos) = state.idle.iter().rposition(|idle| idle.handle.key == *key) {
                let Some(IdleHandle { handle, .. }) = state.idle.remove(pos) else {
                    continue;
                };
                if self.config.probe_on_checkout {
                    let probe = handle.session.lock().ping();
                    if let Err(err) = probe {
                        debug!(
                            handle = handle.id,
                            key = %key,
                            error = %err,
                            "discarded dead idle connection"
                        );
                        handle.close();
                        self.available.notify_one();
                        continue;
                    }
                }
                debug!(handle = handle.id, key = %key, "reused idle connection from pool");
                let proxy = self.proxy(&handle, owner, read_only);
                state.active.insert(slot, ActiveHandle { handle, reuse: 1 });
                return Ok(proxy);
            }

            // Third choice: open a new session while under capacity.
            if state.total() < self.config.max_size {
                state.reserved += 1;
                break None;
            }

            // Fourth choice: replace the least recently returned idle session,
            // unless this thread already holds more than its share.
            if !state.idle.is_empty()
                && state.within_fair_share(owner, self.config.max_size)
                && let Some(oldest) = state.idle.pop_front()
            {
                state.reserved += 1;
                break Some(oldest);
            }

            // Worst case: wait for a release.
            if !waited {
                waited = true;
                *state.wait_counts.entry(key.clone()).or_insert(0) += 1;
            }
            match deadline {
                None => self.available.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        warn!(
                            key = %key,
                            waited_ms = started.elapsed().as_millis() as u64,
                            max_size = self.config.max_size,
                            "connection pool exhausted"
                        );
                        return Err(PoolError::Timeout {
                            key: key.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                    self.available.wait_until(&mut state, deadline);
                }
            }
        };
        drop(state);

        if let Some(idle) = evicted {
            debug!(
                handle = idle.handle.id,
                key = %idle.handle.key,
                idle_ms = idle.returned_at.elapsed().as_millis() as u64,
                "evicted least recently used idle connection"
            );
            idle.handle.close();
        }

        // Do the actual connect outside of the critical section.
        let opened = self.connector.open(key);

        let mut state = self.state.lock();
        state.reserved -= 1;
        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                self.available.notify_one();
                debug!(key = %key, error = %err, "failed to open connection");
                return Err(PoolError::Backend(err));
            }
        };
        let handle = ConnectionHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            poolable: session.poolable(),
            session: Arc::new(Mutex::new(session)),
            created_at: Instant::now(),
        };
        if state.closed {
            drop(state);
            handle.close();
            return Err(PoolError::Closed);
        }
        debug!(
            handle = handle.id,
            key = %key,
            poolable = handle.poolable,
            total = state.total() + 1,
            "created new connection"
        );
        let proxy = self.proxy(&handle, owner, read_only);
        state.active.insert(slot, ActiveHandle { handle, reuse: 1 });
        Ok(proxy)
    }

    fn proxy(
        self: &Arc<Self>,
        handle: &ConnectionHandle,
        owner: ThreadId,
        read_only: bool,
    ) -> PooledConnection {
        PooledConnection::new(
            Arc::clone(self),
            handle.key.clone(),
            Arc::clone(&handle.session),
            handle.id,
            owner,
            read_only,
        )
    }

    /// Return one reference to the handle `owner` holds for `key`.
    ///
    /// The session goes back to the pool only when the last reference of the
    /// owning thread is returned.
    pub(crate) fn release(&self, owner: ThreadId, key: &ConnectionKey) -> Result<(), PoolError> {
        let slot = (owner, key.clone());
        let mut state = self.state.lock();
        let Some(active) = state.active.get_mut(&slot) else {
            warn!(key = %key, "release of a connection the pool does not track");
            return Ok(());
        };
        active.reuse -= 1;
        if active.reuse > 0 {
            debug!(handle = active.handle.id, key = %key, reuse = active.reuse, "released nested reference");
            return Ok(());
        }
        let Some(ActiveHandle { handle, .. }) = state.active.remove(&slot) else {
            return Ok(());
        };
        state.reserved += 1;
        drop(state);

        // Reset the session outside of the critical section.
        let rolled_back = handle.session.lock().rollback();

        let mut state = self.state.lock();
        state.reserved -= 1;
        let (to_close, result) = match rolled_back {
            Err(err) => {
                warn!(
                    handle = handle.id,
                    key = %key,
                    error = %err,
                    "rollback failed on release, dropping connection"
                );
                let result = if self.config.surface_rollback_failures {
                    Err(PoolError::RollbackFailed(err))
                } else {
                    Ok(())
                };
                (Some(handle), result)
            }
            Ok(()) if handle.poolable && !state.closed => {
                debug!(
                    handle = handle.id,
                    key = %key,
                    idle_count = state.idle.len() + 1,
                    "returned connection to pool"
                );
                state.idle.push_back(IdleHandle {
                    handle,
                    returned_at: Instant::now(),
                });
                (None, Ok(()))
            }
            Ok(()) => (Some(handle), Ok(())),
        };
        if state.closed {
            self.available.notify_all();
        } else {
            self.available.notify_one();
        }
        drop(state);

        if let Some(handle) = to_close {
            handle.close();
        }
        result
    }

    /// Close idle sessions returned at least `max_age` ago.
    ///
    /// `Duration::ZERO` closes every idle session. Returns the number closed.
    pub fn reclaim_idle(&self, max_age: Duration) -> usize {
        let expired: VecDeque<IdleHandle> = {
            let mut state = self.state.lock();
            let (keep, expired) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| idle.returned_at.elapsed() < max_age);
            state.idle = keep;
            if !expired.is_empty() {
                self.available.notify_all();
            }
            expired
        };
        for idle in &expired {
            idle.handle.close();
        }
        if !expired.is_empty() {
            info!(
                reclaimed = expired.len(),
                max_age_ms = max_age.as_millis() as u64,
                "reclaimed idle connections"
            );
        }
        expired.len()
    }

    /// [`reclaim_idle`](Self::reclaim_idle) with the configured `idle_max_age`.
    pub fn reclaim_expired(&self) -> usize {
        self.reclaim_idle(self.config.idle_max_age)
    }

    /// Ping every idle session, closing the ones that fail. Returns the number removed.
    pub fn health_check_idle(&self) -> usize {
        let checking: Vec<IdleHandle> = {
            let mut state = self.state.lock();
            let checking: Vec<IdleHandle> = state.idle.drain(..).collect();
            state.reserved += checking.len();
            checking
        };
        let count = checking.len();

        let mut alive = Vec::with_capacity(count);
        let mut dead = Vec::new();
        for idle in checking {
            let probe = idle.handle.session.lock().ping();
            match probe {
                Ok(()) => alive.push(idle),
                Err(err) => {
                    info!(
                        handle = idle.handle.id,
                        key = %idle.handle.key,
                        error = %err,
                        "removed unhealthy idle connection"
                    );
                    dead.push(idle);
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.reserved -= count;
            // Survivors are older than anything released meanwhile.
            for idle in alive.into_iter().rev() {
                if state.closed {
                    dead.push(idle);
                } else {
                    state.idle.push_front(idle);
                }
            }
            self.available.notify_all();
        }

        for idle in &dead {
            idle.handle.close();
        }
        dead.len()
    }

    /// Close the pool: later acquisitions fail with [`PoolError::Closed`],
    /// blocked waiters wake and fail, idle sessions are closed, and sessions
    /// still checked out are closed when they come back.
    ///
    /// Waits up to `drain_timeout` for active sessions to be returned and
    /// reports how many were still out when it gave up.
    pub fn shutdown(&self, drain_timeout: Duration) -> usize {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            self.available.notify_all();
            std::mem::take(&mut state.idle)
        };
        for entry in &idle {
            entry.handle.close();
        }
        info!(
            closed_idle = idle.len(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "connection pool draining started"
        );

        let deadline = Instant::now() + drain_timeout;
        let mut state = self.state.lock();
        while !state.active.is_empty() || state.reserved > 0 {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let remaining = state.active.len();
        if remaining > 0 {
            warn!(remaining, "drain timeout expired with connections still checked out");
        } else {
            info!("all connections drained");
        }
        remaining
    }

    /// Statistics for a single key.
    pub fn stats(&self, key: &ConnectionKey) -> PoolStats {
        let state = self.state.lock();
        let active = state
            .active
            .values()
            .filter(|active| active.handle.key == *key)
            .count();
        let idle = state
            .idle
            .iter()
            .filter(|idle| idle.handle.key == *key)
            .count();
        PoolStats {
            active,
            idle,
            total: active + idle,
            wait_count: state.wait_counts.get(key).copied().unwrap_or(0),
        }
    }

    /// Sessions currently open across all keys, including ones in transition.
    pub fn total_count(&self) -> usize {
        self.state.lock().total()
    }

    /// Log pool statistics for every key at `info` level.
    pub fn log_stats(&self) {
        let state = self.state.lock();
        let mut per_key: HashMap<&ConnectionKey, (usize, usize)> = HashMap::new();
        for active in state.active.values() {
            per_key.entry(&active.handle.key).or_default().0 += 1;
        }
        for idle in &state.idle {
            per_key.entry(&idle.handle.key).or_default().1 += 1;
        }
        for (key, (active, idle)) in per_key {
            info!(
                key = %key,
                active,
                idle,
                total = active + idle,
                wait_count = state.wait_counts.get(key).copied().unwrap_or(0),
                max_size = self.config.max_size,
                "pool statistics"
            );
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
