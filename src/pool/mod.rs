//! Connection pools.
//!
//! [`ConnPool`] bounds the number of live connections with a semaphore and
//! keeps idle connections in a LIFO stack so the warmest one is reused first.
//! [`StickyConnPool`] pins one connection for a transaction, statement or
//! listener; [`SingleConnPool`] wraps one connection that is never redialed.

mod sticky;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::options::{OnClose, Options};
use crate::pg::{Conn, Dialer};

pub use sticky::{SingleConnPool, StickyConnPool};

/// Operations shared by every pool flavour.
pub trait Pooler: Send + Sync {
    /// Borrows a connection.
    fn get(&self) -> impl Future<Output = Result<PooledConn>> + Send;

    /// Returns a healthy connection.
    fn put(&self, conn: PooledConn) -> impl Future<Output = ()> + Send;

    /// Closes a broken connection.
    fn remove(&self, conn: PooledConn, reason: &Error) -> impl Future<Output = ()> + Send;

    /// Number of live connections.
    fn len(&self) -> usize;

    fn idle_len(&self) -> usize;

    fn stats(&self) -> Stats;
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Times an idle connection was reused
    pub hits: u32,
    /// Times a new connection was dialed
    pub misses: u32,
    /// Times waiting for a connection timed out
    pub timeouts: u32,
    pub total_conns: u32,
    pub idle_conns: u32,
    /// Connections closed for exceeding the idle timeout or max age
    pub stale_conns: u32,
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Clone)]
pub struct PoolOptions {
    pub dialer: Arc<dyn Dialer>,
    pub network: String,
    pub addr: String,
    pub dial_timeout: Duration,
    pub pool_size: usize,
    pub pool_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_conn_age: Duration,
    pub idle_check_frequency: Duration,
    pub on_close: Option<OnClose>,
}

impl From<&Options> for PoolOptions {
    fn from(opt: &Options) -> Self {
        Self {
            dialer: opt.dialer.clone(),
            network: opt.network.clone(),
            addr: opt.addr.clone(),
            dial_timeout: opt.dial_timeout,
            pool_size: opt.pool_size.max(1),
            pool_timeout: opt.effective_pool_timeout(),
            idle_timeout: opt.idle_timeout,
            max_conn_age: opt.max_conn_age,
            idle_check_frequency: opt.idle_check_frequency,
            on_close: opt.on_close.clone(),
        }
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from a pool.
///
/// Hand it back with [`Pooler::put`] or [`Pooler::remove`]. Dropping it
/// closes the socket and frees its pool slot.
pub struct PooledConn {
    conn: Option<Conn>,
    /// Pool slot (controls pool size)
    permit: Option<OwnedSemaphorePermit>,
    /// Exclusive use of a sticky pool
    lease: Option<OwnedSemaphorePermit>,
    pool: Weak<PoolInner>,
}

impl PooledConn {
    /// Wraps a connection that belongs to no pool.
    pub fn detached(conn: Conn) -> Self {
        Self {
            conn: Some(conn),
            permit: None,
            lease: None,
            pool: Weak::new(),
        }
    }

    fn take(&mut self) -> Option<Conn> {
        self.conn.take()
    }
}

impl std::ops::Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        // Only put/remove take the connection, and they consume self
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection already released"))
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pooled connection already released"))
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(inner) = self.pool.upgrade() {
                debug!(conn = conn.id(), "pooled connection dropped without being returned");
                inner.forget(&conn);
            }
        }
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConn").field(&self.conn).finish()
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PoolState {
    /// Idle connections, most recently used last
    idle: Vec<Conn>,
    /// Idle plus checked out
    live: usize,
}

/// Internal pool state.
struct PoolInner {
    opt: PoolOptions,
    /// Semaphore to limit checked out connections
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,

    hits: AtomicU32,
    misses: AtomicU32,
    timeouts: AtomicU32,
    stale_conns: AtomicU32,
}

impl PoolInner {
    fn is_stale(&self, conn: &Conn) -> bool {
        let idle = self.opt.idle_timeout;
        let age = self.opt.max_conn_age;
        (!idle.is_zero() && conn.last_used().elapsed() >= idle)
            || (!age.is_zero() && conn.created_at().elapsed() >= age)
    }

    /// Accounts for a connection that is gone without being closed.
    fn forget(&self, conn: &Conn) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        if let Some(on_close) = &self.opt.on_close {
            on_close(conn);
        }
    }

    async fn close_conn(&self, mut conn: Conn) {
        self.forget(&conn);
        if let Err(e) = conn.close().await {
            debug!(conn = conn.id(), error = %e, "error closing connection");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A pool of connections to one server.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    /// Creates the pool and, inside a tokio runtime, starts the idle
    /// reaper. No connection is dialed until the first `get`.
    pub fn new(opt: PoolOptions) -> Self {
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(opt.pool_size)),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(opt.pool_size),
                live: 0,
            }),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            hits: AtomicU32::new(0),
            misses: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
            stale_conns: AtomicU32::new(0),
            opt,
        });

        let reap = !inner.opt.idle_check_frequency.is_zero()
            && (!inner.opt.idle_timeout.is_zero() || !inner.opt.max_conn_age.is_zero());
        if reap {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(reaper(
                        Arc::downgrade(&inner),
                        inner.opt.idle_check_frequency,
                        inner.shutdown.clone(),
                    ));
                }
                Err(_) => debug!("no tokio runtime, idle connections will not be reaped"),
            }
        }

        Self { inner }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.opt
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Opens a new, uninitialized connection outside the pool's accounting.
    pub async fn dial(&self) -> Result<Conn> {
        let opt = &self.inner.opt;
        let dial = opt.dialer.dial(&opt.network, &opt.addr);
        let socket = if opt.dial_timeout.is_zero() {
            dial.await?
        } else {
            tokio::time::timeout(opt.dial_timeout, dial)
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout"))??
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(conn = id, network = %opt.network, addr = %opt.addr, "dialed");
        Ok(Conn::new(id, socket))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = self.inner.permits.clone().acquire_owned();
        match tokio::time::timeout(self.inner.opt.pool_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is closed by `close`
            Ok(Err(_)) => Err(Error::PoolClosed),
            Err(_) => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::PoolTimeout)
            }
        }
    }

    fn wrap(&self, conn: Conn, permit: OwnedSemaphorePermit) -> PooledConn {
        PooledConn {
            conn: Some(conn),
            permit: Some(permit),
            lease: None,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Closes idle connections past the idle timeout or max age. Returns
    /// how many were closed.
    pub async fn reap_stale_conns(&self) -> usize {
        // Skip the pass when every slot is in use
        let Ok(_permit) = self.inner.permits.clone().try_acquire_owned() else {
            return 0;
        };

        let stale: Vec<Conn> = {
            let mut state = self.inner.state.lock();
            let (stale, fresh) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|c| self.inner.is_stale(c));
            state.idle = fresh;
            stale
        };

        let n = stale.len();
        for conn in stale {
            self.inner.stale_conns.fetch_add(1, Ordering::Relaxed);
            self.inner.close_conn(conn).await;
        }
        n
    }

    /// Closes every idle connection; later `get`s fail with
    /// [`Error::PoolClosed`]. Checked out connections are closed when they
    /// are returned.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::PoolClosed);
        }
        self.inner.permits.close();
        self.inner.shutdown.cancel();

        let idle = std::mem::take(&mut self.inner.state.lock().idle);
        debug!(idle = idle.len(), "closing pool");
        for conn in idle {
            self.inner.close_conn(conn).await;
        }
        Ok(())
    }
}

impl Pooler for ConnPool {
    async fn get(&self) -> Result<PooledConn> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let permit = self.acquire_permit().await?;

        loop {
            let conn = self.inner.state.lock().idle.pop();
            match conn {
                Some(conn) if self.inner.is_stale(&conn) => {
                    self.inner.stale_conns.fetch_add(1, Ordering::Relaxed);
                    self.inner.close_conn(conn).await;
                }
                Some(conn) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.wrap(conn, permit));
                }
                None => break,
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        // The permit bounds checked out connections, so live stays within
        // pool_size once the idle stack is empty
        let conn = self.dial().await?;
        self.inner.state.lock().live += 1;
        Ok(self.wrap(conn, permit))
    }

    async fn put(&self, mut conn: PooledConn) {
        let Some(conn) = conn.take() else { return };
        let age = self.inner.opt.max_conn_age;
        if self.is_closed() {
            self.inner.close_conn(conn).await;
        } else if !age.is_zero() && conn.created_at().elapsed() >= age {
            self.inner.stale_conns.fetch_add(1, Ordering::Relaxed);
            self.inner.close_conn(conn).await;
        } else {
            self.inner.state.lock().idle.push(conn);
        }
    }

    async fn remove(&self, mut conn: PooledConn, reason: &Error) {
        let Some(conn) = conn.take() else { return };
        debug!(conn = conn.id(), error = %reason, "removing connection");
        self.inner.close_conn(conn).await;
    }

    fn len(&self) -> usize {
        self.inner.state.lock().live
    }

    fn idle_len(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    fn stats(&self) -> Stats {
        let (live, idle) = {
            let state = self.inner.state.lock();
            (state.live, state.idle.len())
        };
        Stats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            total_conns: live as u32,
            idle_conns: idle as u32,
            stale_conns: self.inner.stale_conns.load(Ordering::Relaxed),
        }
    }
}

async fn reaper(pool: Weak<PoolInner>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else { return };
        let n = ConnPool { inner }.reap_stale_conns().await;
        if n > 0 {
            debug!(reaped = n, "closed stale connections");
        }
    }
}
