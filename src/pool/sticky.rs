//! Pools that hand out one pinned connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{ConnPool, PooledConn, Pooler, Stats};
use crate::error::{Error, Result};

// ============================================================================
// Sticky Pool
// ============================================================================

/// Pins one connection of a parent pool.
///
/// `get` always returns the same connection until it is removed, after
/// which the next `get` acquires a fresh one from the parent. Only one
/// borrower holds the connection at a time.
pub struct StickyConnPool {
    parent: ConnPool,
    slot: Mutex<Option<PooledConn>>,
    lease: Arc<Semaphore>,
    closed: AtomicBool,
}

impl StickyConnPool {
    pub fn new(parent: ConnPool) -> Self {
        Self {
            parent,
            slot: Mutex::new(None),
            lease: Arc::new(Semaphore::new(1)),
            closed: AtomicBool::new(false),
        }
    }

    /// Starts out holding `conn`.
    pub fn with_conn(parent: ConnPool, conn: PooledConn) -> Self {
        let pool = Self::new(parent);
        *pool.slot.lock() = Some(conn);
        pool
    }

    pub fn parent(&self) -> &ConnPool {
        &self.parent
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Id of the pinned connection, if one is held and not borrowed.
    pub fn conn_id(&self) -> Option<u64> {
        self.slot.lock().as_ref().map(|c| c.id())
    }

    /// Hands the pinned connection back to the parent pool; the next `get`
    /// acquires a new one.
    pub async fn release(&self) {
        let conn = self.slot.lock().take();
        if let Some(conn) = conn {
            self.parent.put(conn).await;
        }
    }

    /// Closes the pinned connection instead of handing it back, and fails
    /// every later `get`. Used when the session state must not leak into
    /// the parent pool.
    pub async fn discard(&self, reason: &Error) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::PoolClosed);
        }
        self.lease.close();
        let conn = self.slot.lock().take();
        if let Some(conn) = conn {
            self.parent.remove(conn, reason).await;
        }
        Ok(())
    }

    /// Releases the connection and fails every later `get`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::PoolClosed);
        }
        self.lease.close();
        self.release().await;
        Ok(())
    }
}

impl Pooler for StickyConnPool {
    async fn get(&self) -> Result<PooledConn> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let lease = self
            .lease
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        let held = self.slot.lock().take();
        let mut conn = match held {
            Some(conn) => conn,
            None => self.parent.get().await?,
        };
        conn.lease = Some(lease);
        Ok(conn)
    }

    async fn put(&self, mut conn: PooledConn) {
        let lease = conn.lease.take();
        if self.is_closed() {
            self.parent.put(conn).await;
        } else {
            *self.slot.lock() = Some(conn);
        }
        drop(lease);
    }

    async fn remove(&self, mut conn: PooledConn, reason: &Error) {
        let lease = conn.lease.take();
        self.parent.remove(conn, reason).await;
        drop(lease);
    }

    fn len(&self) -> usize {
        let borrowed = self.lease.available_permits() == 0 && !self.is_closed();
        usize::from(self.slot.lock().is_some() || borrowed)
    }

    fn idle_len(&self) -> usize {
        usize::from(self.slot.lock().is_some())
    }

    fn stats(&self) -> Stats {
        self.parent.stats()
    }
}

impl std::fmt::Debug for StickyConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickyConnPool")
            .field("conn", &self.conn_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Single Pool
// ============================================================================

/// Wraps one connection that is never redialed.
///
/// Used for the side connection that carries a CancelRequest.
pub struct SingleConnPool {
    slot: Mutex<Option<PooledConn>>,
}

impl SingleConnPool {
    pub fn new(conn: PooledConn) -> Self {
        Self {
            slot: Mutex::new(Some(conn)),
        }
    }

    /// Closes the connection if it is not borrowed.
    pub async fn close(&self) {
        let conn = self.slot.lock().take();
        if let Some(conn) = conn {
            close_detached(conn).await;
        }
    }
}

impl Pooler for SingleConnPool {
    async fn get(&self) -> Result<PooledConn> {
        self.slot.lock().take().ok_or(Error::PoolClosed)
    }

    async fn put(&self, conn: PooledConn) {
        *self.slot.lock() = Some(conn);
    }

    async fn remove(&self, conn: PooledConn, reason: &Error) {
        debug!(conn = conn.id(), error = %reason, "closing single connection");
        close_detached(conn).await;
    }

    fn len(&self) -> usize {
        self.idle_len()
    }

    fn idle_len(&self) -> usize {
        usize::from(self.slot.lock().is_some())
    }

    fn stats(&self) -> Stats {
        let n = self.idle_len() as u32;
        Stats {
            total_conns: n,
            idle_conns: n,
            ..Stats::default()
        }
    }
}

async fn close_detached(mut conn: PooledConn) {
    let Some(mut conn) = conn.take() else { return };
    if let Err(e) = conn.close().await {
        debug!(conn = conn.id(), error = %e, "error closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{pool_options, PipeDialer};
    use std::time::Duration;

    fn sticky() -> (StickyConnPool, ConnPool) {
        let parent = ConnPool::new(pool_options(Arc::new(PipeDialer::default()), 2));
        (StickyConnPool::new(parent.clone()), parent)
    }

    #[tokio::test]
    async fn test_sticky_returns_same_conn() {
        let (pool, parent) = sticky();
        let conn = pool.get().await.unwrap();
        let id = conn.id();
        pool.put(conn).await;
        assert_eq!(pool.conn_id(), Some(id));

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.id(), id);
        pool.put(conn).await;

        // Pinned, not idle in the parent
        assert_eq!(parent.idle_len(), 0);
        assert_eq!(parent.len(), 1);
    }

    #[tokio::test]
    async fn test_sticky_remove_acquires_new_conn() {
        let (pool, parent) = sticky();
        let conn = pool.get().await.unwrap();
        let first = conn.id();
        pool.remove(conn, &Error::Protocol("bad".into())).await;
        assert_eq!(pool.conn_id(), None);

        let conn = pool.get().await.unwrap();
        assert_ne!(conn.id(), first);
        pool.put(conn).await;
        assert_eq!(parent.len(), 1);
    }

    #[tokio::test]
    async fn test_sticky_release_returns_to_parent() {
        let (pool, parent) = sticky();
        let conn = pool.get().await.unwrap();
        pool.put(conn).await;

        pool.release().await;
        assert_eq!(parent.idle_len(), 1);

        pool.close().await.unwrap();
        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));
        assert!(matches!(pool.close().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_sticky_serializes_borrowers() {
        let (pool, _parent) = sticky();
        let pool = Arc::new(pool);
        let conn = pool.get().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.get().await.unwrap();
                let id = conn.id();
                pool.put(conn).await;
                id
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let id = conn.id();
        pool.put(conn).await;
        assert_eq!(waiter.await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_single_pool_hands_out_once() {
        let (_, parent) = sticky();
        let conn = PooledConn::detached(parent.dial().await.unwrap());
        let pool = SingleConnPool::new(conn);

        let conn = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));
        pool.put(conn).await;
        assert_eq!(pool.len(), 1);

        let conn = pool.get().await.unwrap();
        pool.remove(conn, &Error::Cancelled).await;
        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));
        // Detached connections never touch the parent's accounting
        assert_eq!(parent.len(), 0);
    }
}
