//! # Connection Pool
//!
//! Purpose: Share a bounded set of connections between threads, handing each
//! caller an exclusive lease and blocking (with an optional deadline) when
//! every connection is in use.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving bookkeeping; the
//!    factory runs outside it with the slot reserved.
//! 3. **Wake on Release**: Waiters sleep on a condition variable that
//!    `release` signals, and re-check state under the lock on every wakeup.
//! 4. **RAII Leases**: `PooledConnection` returns itself on drop, so every exit
//!    path releases the lease.
//!
//! ## Invariant
//! `free + leased + connecting <= capacity`, and each pooled connection is in
//! exactly one of `free` or `leased`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{Connection, Mode, Transport};
use crate::error::{ClientError, ClientResult, UsageError};

/// Builds the transports a pool wraps into connections.
///
/// Supplied once at pool construction. Closures returning
/// `ClientResult<T>` implement it directly.
pub trait ConnectionFactory<T>: Send + Sync {
    fn connect(&self) -> ClientResult<T>;
}

impl<T, F> ConnectionFactory<T> for F
where
    F: Fn() -> ClientResult<T> + Send + Sync,
{
    fn connect(&self) -> ClientResult<T> {
        self()
    }
}

/// Factory for plain TCP transports.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Parses `addr`, e.g. "127.0.0.1:6379".
    pub fn new(addr: &str) -> ClientResult<Self> {
        let addr = addr
            .parse()
            .map_err(|_| ClientError::InvalidAddress(addr.to_string()))?;
        Ok(TcpConnector {
            addr,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        })
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl ConnectionFactory<TcpStream> for TcpConnector {
    fn connect(&self) -> ClientResult<TcpStream> {
        let stream = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&self.addr, timeout)?,
            None => TcpStream::connect(self.addr)?,
        };
        if let Some(timeout) = self.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = self.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections issued at once (free + leased). Zero is treated as one.
    pub capacity: usize,
    /// Connections opened eagerly at construction, capped at `capacity`.
    pub prewarm: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: 16,
            prewarm: 0,
        }
    }
}

struct PoolState<T> {
    free: VecDeque<Connection<T>>,
    leased: HashSet<u64>,
    // Slots reserved for connections the factory is still building.
    connecting: usize,
}

impl<T> PoolState<T> {
    fn issued(&self) -> usize {
        self.free.len() + self.leased.len() + self.connecting
    }
}

struct PoolInner<T> {
    capacity: usize,
    factory: Box<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

impl<T: Transport> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        // Bookkeeping is consistent before any user code runs, so a poisoned
        // guard is still valid.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkin(&self, conn: Connection<T>) -> ClientResult<()> {
        let mut state = self.lock();
        if !state.leased.remove(&conn.id()) {
            return Err(UsageError::NotLeased { id: conn.id() }.into());
        }

        // A scope abandoned by a panic leaves the mode set and may leave bytes
        // buffered, so it is as unusable as a broken stream.
        if conn.is_broken() || conn.mode() != Mode::Normal {
            drop(state);
            self.available.notify_one();
            warn!(conn = conn.id(), mode = ?conn.mode(), "dropping unusable connection instead of pooling it");
            if let Err(err) = conn.close() {
                debug!(error = %err, "closing broken connection failed");
            }
            return Ok(());
        }

        debug!(conn = conn.id(), "released pooled connection");
        state.free.push_back(conn);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn forget(&self, id: u64) {
        let mut state = self.lock();
        state.leased.remove(&id);
        drop(state);
        self.available.notify_one();
    }
}

/// Connection pool handle. Clones share the same pool.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Pool<T> {
    /// Creates a pool and opens `config.prewarm` connections up front.
    pub fn new(config: PoolConfig, factory: impl ConnectionFactory<T> + 'static) -> ClientResult<Self> {
        let capacity = config.capacity.max(1);
        let prewarm = config.prewarm.min(capacity);

        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..prewarm {
            let conn = Connection::new(factory.connect()?);
            debug!(conn = conn.id(), "opened prewarmed connection");
            free.push_back(conn);
        }

        Ok(Pool {
            inner: Arc::new(PoolInner {
                capacity,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    free,
                    leased: HashSet::with_capacity(capacity),
                    connecting: 0,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Leases a connection, waiting up to `timeout` (forever when `None`).
    ///
    /// Free connections are reused oldest-released first. When none are free
    /// and the pool is below capacity, a new one is opened. A timed-out call
    /// leaves the pool untouched. A timeout too large to form a deadline
    /// waits forever.
    pub fn acquire(&self, timeout: Option<Duration>) -> ClientResult<PooledConnection<T>> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.inner.lock();

        loop {
            if let Some(conn) = state.free.pop_front() {
                state.leased.insert(conn.id());
                drop(state);
                debug!(conn = conn.id(), "leased idle connection");
                return Ok(self.lease(conn));
            }

            if state.issued() < self.inner.capacity {
                state.connecting += 1;
                drop(state);
                return self.open();
            }

            state = match deadline {
                None => self
                    .inner
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(?timeout, "pool acquire timed out");
                        return Err(ClientError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.inner
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Returns a leased connection to this pool.
    ///
    /// A lease from another pool is rejected with `UsageError::NotLeased` and
    /// goes back to the pool it came from.
    pub fn release(&self, mut conn: PooledConnection<T>) -> ClientResult<()> {
        if !Arc::ptr_eq(&self.inner, &conn.pool) {
            return Err(UsageError::NotLeased { id: conn.id() }.into());
        }
        match conn.conn.take() {
            Some(inner) => self.inner.checkin(inner),
            None => Ok(()),
        }
    }

    /// Leases a connection for the duration of `body`.
    ///
    /// The lease is returned on every exit path, including panics.
    pub fn scoped_acquire<F, R, E>(&self, timeout: Option<Duration>, body: F) -> Result<R, E>
    where
        F: FnOnce(&mut Connection<T>) -> Result<R, E>,
        E: From<ClientError>,
    {
        let mut conn = self.acquire(timeout)?;
        let result = body(&mut *conn);
        conn.release();
        result
    }

    /// Idle connections ready for reuse.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Connections currently checked out.
    pub fn leased_count(&self) -> usize {
        self.inner.lock().leased.len()
    }

    /// Connections owned by the pool, free or leased.
    pub fn size(&self) -> usize {
        let state = self.inner.lock();
        state.free.len() + state.leased.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn open(&self) -> ClientResult<PooledConnection<T>> {
        let opened = self.inner.factory.connect();
        let mut state = self.inner.lock();
        state.connecting -= 1;
        match opened {
            Ok(transport) => {
                let conn = Connection::new(transport);
                state.leased.insert(conn.id());
                drop(state);
                debug!(conn = conn.id(), "opened pooled connection");
                Ok(self.lease(conn))
            }
            Err(err) => {
                drop(state);
                // The reserved slot is free again; let a waiter try.
                self.inner.available.notify_one();
                Err(err)
            }
        }
    }

    fn lease(&self, conn: Connection<T>) -> PooledConnection<T> {
        PooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
        }
    }
}

/// RAII lease returning its connection to the pool on drop.
///
/// Broken connections, and connections left inside a scope by a panic, are
/// closed instead of pooled, freeing their slot.
pub struct PooledConnection<T: Transport> {
    pool: Arc<PoolInner<T>>,
    conn: Option<Connection<T>>,
}

impl<T: Transport> PooledConnection<T> {
    /// Returns the connection to its pool now.
    pub fn release(mut self) {
        self.checkin();
    }

    /// Closes the connection and frees its pool slot.
    pub fn close(mut self) -> ClientResult<()> {
        match self.conn.take() {
            Some(conn) => {
                self.pool.forget(conn.id());
                debug!(conn = conn.id(), "closing pooled connection");
                conn.close()
            }
            None => Ok(()),
        }
    }

    fn checkin(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.checkin(conn) {
                warn!(error = %err, "failed to return connection to pool");
            }
        }
    }
}

impl<T: Transport> Deref for PooledConnection<T> {
    type Target = Connection<T>;

    fn deref(&self) -> &Connection<T> {
        self.conn.as_ref().expect("lease holds a connection until released")
    }
}

impl<T: Transport> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut Connection<T> {
        self.conn.as_mut().expect("lease holds a connection until released")
    }
}

impl<T: Transport> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("conn", &self.conn).finish()
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        self.checkin();
    }
}
