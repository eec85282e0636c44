//! LISTEN/NOTIFY.
//!
//! A [`Listener`] keeps its own connection. When that connection breaks,
//! the next receive dials a new one and subscribes it to every channel
//! again.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{release, retry_backoff, Db};
use crate::error::{Error, Result};
use crate::pg::Notification;
use crate::pool::{PooledConn, Pooler, StickyConnPool};
use crate::row::Discard;

/// Queue size of [`Listener::channel`].
pub const CHANNEL_CAPACITY: usize = 100;

/// How long the channel task waits for room in a full queue before
/// dropping a notification.
const CHANNEL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Silence after which the channel task pings the server.
const CHANNEL_PING_INTERVAL: Duration = Duration::from_secs(30);

struct Inner {
    db: Db,
    pool: StickyConnPool,
    channels: Mutex<Vec<String>>,
    /// Connection the channels are subscribed on.
    conn_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    /// Operations waiting for the connection; a pending read yields to them.
    waiting: AtomicUsize,
    /// Interrupts a pending read so other operations get the connection.
    wake: Notify,
    task: Mutex<Option<CancellationToken>>,
}

/// Receives notifications sent with `NOTIFY` or `pg_notify`.
pub struct Listener {
    inner: Arc<Inner>,
}

impl Listener {
    pub(crate) fn new(db: Db) -> Self {
        let pool = StickyConnPool::new(db.pool().clone());
        Self {
            inner: Arc::new(Inner {
                db,
                pool,
                channels: Mutex::new(Vec::new()),
                conn_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                waiting: AtomicUsize::new(0),
                wake: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Channels currently subscribed to.
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Subscribes to `channels`. Channels already subscribed to are
    /// skipped.
    pub async fn listen(&self, channels: &[&str]) -> Result<()> {
        let inner = &self.inner;
        inner.check()?;
        let mut conn = inner.conn_now().await?;

        let new: Vec<String> = {
            let have = inner.channels.lock();
            let mut new: Vec<String> = Vec::new();
            for ch in channels {
                if !have.iter().any(|h| h == ch) && !new.iter().any(|n| n == ch) {
                    new.push(ch.to_string());
                }
            }
            new
        };
        if new.is_empty() {
            inner.release(conn, &Ok(())).await;
            return Ok(());
        }

        let res = conn
            .simple_query(&channel_query("LISTEN", &new), &mut Discard)
            .await
            .map(|_| ());
        inner.release(conn, &res).await;
        res?;

        debug!(channels = ?new, "listening");
        inner.channels.lock().extend(new);
        Ok(())
    }

    /// Unsubscribes from `channels`.
    pub async fn unlisten(&self, channels: &[&str]) -> Result<()> {
        let inner = &self.inner;
        inner.check()?;

        let gone: Vec<String> = {
            let have = inner.channels.lock();
            have.iter()
                .filter(|h| channels.contains(&h.as_str()))
                .cloned()
                .collect()
        };
        if gone.is_empty() {
            return Ok(());
        }

        let mut conn = inner.conn_now().await?;
        let res = conn
            .simple_query(&channel_query("UNLISTEN", &gone), &mut Discard)
            .await
            .map(|_| ());
        inner.release(conn, &res).await;
        res?;

        inner.channels.lock().retain(|h| !gone.contains(h));
        Ok(())
    }

    /// Waits up to `timeout` for the next notification. A zero timeout
    /// waits forever.
    ///
    /// A timeout leaves the connection in place; other errors replace it
    /// on the next call.
    pub async fn receive(&self, timeout: Duration) -> Result<Notification> {
        loop {
            if let Some(n) = self.inner.wait(timeout, None).await? {
                return Ok(n);
            }
        }
    }

    /// Delivers notifications through a queue of [`CHANNEL_CAPACITY`]
    /// entries filled by a background task.
    ///
    /// A notification that finds the queue full for a second is dropped.
    /// Calling this again stops the previous queue. Must be called within
    /// a tokio runtime.
    pub fn channel(&self) -> mpsc::Receiver<Notification> {
        self.channel_size(CHANNEL_CAPACITY)
    }

    /// Like [`channel`](Self::channel) with a custom queue size.
    pub fn channel_size(&self, size: usize) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(size.max(1));
        let stop = self.inner.shutdown.child_token();
        if let Some(prev) = self.inner.task.lock().replace(stop.clone()) {
            prev.cancel();
        }
        if self.is_closed() {
            return rx;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_channel(self.inner.clone(), tx, stop));
            }
            Err(_) => debug!("no tokio runtime, notification channel closed"),
        }
        rx
    }

    /// Stops receiving and closes the connection. Its subscriptions end
    /// with the session.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::ListenerClosed);
        }
        self.inner.shutdown.cancel();
        let _ = self.inner.pool.discard(&Error::ListenerClosed).await;
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let inner = self.inner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = inner.pool.discard(&Error::ListenerClosed).await;
            });
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("channels", &*self.inner.channels.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ListenerClosed);
        }
        Ok(())
    }

    /// Borrows the listener's connection, subscribing a new one to every
    /// channel.
    async fn conn(&self) -> Result<PooledConn> {
        let mut conn = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(Error::ListenerClosed),
            res = self.db.acquire(&self.pool) => res?,
        };
        conn.set_listening(true);

        if conn.id() != self.conn_id.load(Ordering::Acquire) {
            let channels = self.channels.lock().clone();
            if !channels.is_empty() {
                warn!(conn = conn.id(), channels = ?channels, "listener reconnected, subscribing again");
                let res = conn
                    .simple_query(&channel_query("LISTEN", &channels), &mut Discard)
                    .await
                    .map(|_| ());
                if let Err(e) = res {
                    self.release_failed(conn, &e).await;
                    return Err(e);
                }
            }
            self.conn_id.store(conn.id(), Ordering::Release);
        }
        Ok(conn)
    }

    async fn release<T>(&self, conn: PooledConn, res: &Result<T>) {
        if self.is_closed() {
            // A subscribed session must not go back to the pool
            self.pool.remove(conn, &Error::ListenerClosed).await;
        } else {
            release(&self.pool, conn, res, true).await;
        }
    }

    async fn release_failed(&self, conn: PooledConn, err: &Error) {
        if self.is_closed() || err.is_bad_conn(true) {
            self.pool.remove(conn, err).await;
        } else {
            self.pool.put(conn).await;
        }
    }

    /// Borrows the connection ahead of any pending read, which is
    /// interrupted and retried after this operation releases it.
    async fn conn_now(&self) -> Result<PooledConn> {
        let _waiting = Waiting::enter(&self.waiting);
        self.wake.notify_waiters();
        self.conn().await
    }

    /// Reads the next notification. Returns `None` when another operation
    /// wants the connection or `stop` fires.
    async fn wait(
        &self,
        timeout: Duration,
        stop: Option<&CancellationToken>,
    ) -> Result<Option<Notification>> {
        self.check()?;
        // Registered before checking `waiting` so no wake is missed
        let woken = self.wake.notified();
        tokio::pin!(woken);

        let mut conn = self.conn().await?;
        if self.waiting.load(Ordering::SeqCst) > 0 {
            self.release(conn, &Ok(())).await;
            tokio::task::yield_now().await;
            return Ok(None);
        }
        let res = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::ListenerClosed),
            _ = cancelled(self.db.cancel_token()) => Err(Error::Cancelled),
            _ = cancelled(stop) => Ok(None),
            _ = &mut woken => Ok(None),
            res = conn.receive_notification(timeout) => res.map(Some),
        };
        self.release(conn, &res).await;
        res
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let res = conn.simple_query(b"SELECT 1", &mut Discard).await.map(|_| ());
        self.release(conn, &res).await;
        res
    }
}

/// Counts an operation in `Inner::waiting` until dropped.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn run_channel(inner: Arc<Inner>, tx: mpsc::Sender<Notification>, stop: CancellationToken) {
    let opt = inner.db.options();
    let (min_backoff, max_backoff) = (opt.min_retry_backoff, opt.max_retry_backoff);
    let mut failures = 0u32;

    loop {
        if stop.is_cancelled() || inner.is_closed() {
            return;
        }

        match inner.wait(CHANNEL_PING_INTERVAL, Some(&stop)).await {
            Ok(Some(n)) => {
                failures = 0;
                match tx.send_timeout(n, CHANNEL_SEND_TIMEOUT).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(n)) => {
                        warn!(channel = %n.channel, "notification queue full, dropping notification")
                    }
                    Err(SendTimeoutError::Closed(_)) => return,
                }
            }
            // Woken so another operation can use the connection
            Ok(None) => tokio::task::yield_now().await,
            Err(Error::ListenerClosed) | Err(Error::Cancelled) => return,
            Err(e) if e.is_timeout() => {
                if let Err(e) = inner.ping().await {
                    warn!(error = %e, "listener ping failed");
                }
            }
            Err(e) => {
                let backoff = retry_backoff(failures, min_backoff, max_backoff);
                failures = failures.saturating_add(1);
                warn!(error = %e, backoff = ?backoff, "listener receive failed, reconnecting");
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// `LISTEN "a"; LISTEN "b"` for the given channels.
fn channel_query(command: &str, channels: &[String]) -> Vec<u8> {
    let mut q = Vec::new();
    for (i, ch) in channels.iter().enumerate() {
        if i > 0 {
            q.extend_from_slice(b"; ");
        }
        q.extend_from_slice(command.as_bytes());
        q.extend_from_slice(b" \"");
        for b in ch.bytes() {
            if b == b'"' {
                q.push(b'"');
            }
            q.push(b);
        }
        q.push(b'"');
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{answer_queries, done, scripted_db, test_options, QueryLog, ScriptDialer};
    use crate::pg::tests::be;
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncReadExt;

    fn listen_reply(notifications: &[(&str, &str)]) -> Vec<Vec<u8>> {
        let mut reply = done("LISTEN", b'I');
        for (channel, payload) in notifications {
            reply.push(be::notification(42, channel, payload));
        }
        reply
    }

    #[test]
    fn test_channel_query_quotes_names() {
        let q = channel_query("LISTEN", &["jobs".to_string(), "a\"b".to_string()]);
        assert_eq!(q, b"LISTEN \"jobs\"; LISTEN \"a\"\"b\"");
    }

    #[tokio::test]
    async fn test_listen_and_receive() {
        let (db, log, _) = scripted_db(vec![listen_reply(&[("ch", "hi")])]);

        let ln = db.listen(&["ch", "ch"]).await.unwrap();
        let n = ln.receive(Duration::from_secs(1)).await.unwrap();

        assert_eq!((n.channel.as_str(), n.payload.as_str()), ("ch", "hi"));
        assert_eq!(n.process_id, 42);
        assert_eq!(*log.lock(), vec!["LISTEN \"ch\""]);
        assert_eq!(ln.channels(), vec!["ch"]);
    }

    #[tokio::test]
    async fn test_receive_timeout_keeps_connection() {
        let dialer = ScriptDialer::new(|_, mut backend| {
            Box::pin(async move {
                backend.accept_startup().await;
                backend.expect(b'Q').await;
                backend.send(&done("LISTEN", b'I')).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                backend.send(&[be::notification(42, "ch", "late")]).await;
                let mut rest = Vec::new();
                let _ = backend.io.read_to_end(&mut rest).await;
            })
        });
        let db = Db::connect(test_options(dialer.clone())).unwrap();
        let ln = db.listen(&["ch"]).await.unwrap();

        let err = ln.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());

        let n = ln.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(n.payload, "late");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_subscribes_again() {
        let log = QueryLog::default();
        let handler_log = log.clone();
        let dialer = ScriptDialer::new(move |n, backend| {
            let log = handler_log.clone();
            Box::pin(async move {
                if n == 0 {
                    // Answer LISTEN, then hang up
                    let mut backend = backend;
                    backend.accept_startup().await;
                    backend.expect(b'Q').await;
                    backend.send(&done("LISTEN", b'I')).await;
                    return;
                }
                answer_queries(backend, log, vec![listen_reply(&[("ch", "again")])]).await;
            })
        });
        let db = Db::connect(test_options(dialer.clone())).unwrap();
        let ln = db.listen(&["ch"]).await.unwrap();

        let err = ln.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_bad_conn(true));

        let n = ln.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(n.payload, "again");
        assert_eq!(*log.lock(), vec!["LISTEN \"ch\""]);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_channel_delivers_in_order() {
        let (db, _, _) = scripted_db(vec![listen_reply(&[("ch", "1"), ("ch", "2")])]);
        let ln = db.listen(&["ch"]).await.unwrap();

        let mut rx = ln.channel();
        assert_eq!(rx.recv().await.unwrap().payload, "1");
        assert_eq!(rx.recv().await.unwrap().payload, "2");

        ln.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_listen_during_receive() {
        let (db, log, _) = scripted_db(vec![
            done("LISTEN", b'I'),
            done("LISTEN", b'I'),
            listen_reply(&[("b", "hello")]),
        ]);
        let ln = Arc::new(db.listen(&["a"]).await.unwrap());

        let waiter = {
            let ln = ln.clone();
            tokio::spawn(async move { ln.receive(Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_millis(500), ln.listen(&["b"]))
            .await
            .expect("listen waited for the pending receive")
            .unwrap();
        assert_eq!(*log.lock(), vec!["LISTEN \"a\"", "LISTEN \"b\""]);
        assert!(!waiter.is_finished());

        // The interrupted receive resumes on the same connection
        tokio::time::timeout(Duration::from_millis(500), ln.listen(&["c"]))
            .await
            .unwrap()
            .unwrap();
        let n = waiter.await.unwrap().unwrap();
        assert_eq!(n.payload, "hello");
        assert_eq!(ln.channels(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unlisten() {
        let (db, log, _) = scripted_db(vec![done("LISTEN", b'I'), done("UNLISTEN", b'I')]);
        let ln = db.listen(&["a", "b"]).await.unwrap();

        ln.unlisten(&["a", "missing"]).await.unwrap();
        assert_eq!(ln.channels(), vec!["b"]);
        assert_eq!(*log.lock(), vec!["LISTEN \"a\"; LISTEN \"b\"", "UNLISTEN \"a\""]);
    }

    #[tokio::test]
    async fn test_close() {
        let (db, _, _) = scripted_db(vec![done("LISTEN", b'I')]);
        let ln = db.listen(&["ch"]).await.unwrap();

        ln.close().await.unwrap();
        assert!(matches!(ln.receive(Duration::from_millis(10)).await, Err(Error::ListenerClosed)));
        assert!(matches!(ln.listen(&["x"]).await, Err(Error::ListenerClosed)));
        assert!(matches!(ln.close().await, Err(Error::ListenerClosed)));
        // The subscribed connection is closed, not pooled
        assert_eq!(db.pool().len(), 0);
    }
}
