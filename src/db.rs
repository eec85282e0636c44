//! The database handle.
//!
//! [`Db`] owns the connection pool and runs every query through the same
//! path: format the template, borrow a connection (initializing it on first
//! use), run the exchange raced against the handle's cancellation token,
//! then return or discard the connection. `exec` and `query` retry
//! transient failures with jittered exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::format::Formatter;
use crate::hook::{Hooks, QueryEvent, QueryHook};
use crate::listener::Listener;
use crate::options::Options;
use crate::pg::Conn;
use crate::pool::{ConnPool, PoolOptions, PooledConn, Pooler, SingleConnPool, Stats, StickyConnPool};
use crate::row::{Discard, FromRow, Model, QueryResult};
use crate::stmt::{Stmt, StmtState};
use crate::tx::Tx;
use crate::types::Append;
use crate::BoxFuture;

/// Time an exchange gets to finish after a CancelRequest was sent.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Exchanges
// ============================================================================

/// One request/response round trip on a borrowed connection.
pub(crate) enum Exchange<'a> {
    Simple {
        query: &'a [u8],
        model: &'a mut dyn Model,
    },
    Prepare {
        query: &'a str,
        state: &'a mut StmtState,
    },
    Stmt {
        query: &'a str,
        state: &'a mut StmtState,
        params: &'a [&'a dyn Append],
        model: &'a mut dyn Model,
    },
    CloseStmt {
        state: &'a StmtState,
    },
    CopyIn {
        query: &'a [u8],
        source: &'a mut (dyn AsyncRead + Unpin + Send),
    },
    CopyOut {
        query: &'a [u8],
        sink: &'a mut (dyn AsyncWrite + Unpin + Send),
    },
}

impl Exchange<'_> {
    fn reset(&mut self) {
        match self {
            Exchange::Simple { model, .. } | Exchange::Stmt { model, .. } => model.reset(),
            _ => {}
        }
    }

    async fn run(&mut self, conn: &mut Conn) -> Result<QueryResult> {
        match self {
            Exchange::Simple { query, model } => conn.simple_query(query, &mut **model).await,
            Exchange::Prepare { query, state } => {
                state.prepare(conn, query).await?;
                Ok(QueryResult::empty())
            }
            Exchange::Stmt {
                query,
                state,
                params,
                model,
            } => state.exec(conn, query, params, &mut **model).await,
            Exchange::CloseStmt { state } => {
                state.close(conn).await?;
                Ok(QueryResult::empty())
            }
            Exchange::CopyIn { query, source } => conn.copy_in(query, &mut **source).await,
            Exchange::CopyOut { query, sink } => conn.copy_out(query, &mut **sink).await,
        }
    }
}

// ============================================================================
// Db
// ============================================================================

struct Shared {
    opt: Options,
    pool: ConnPool,
}

/// A handle to a PostgreSQL database.
///
/// Cheap to clone; clones share the pool. The `with_*` methods return
/// handles with different timeouts, parameters or cancellation tokens.
///
/// ```no_run
/// # async fn run() -> pgkit::Result<()> {
/// let db = pgkit::Db::from_url("postgres://postgres@localhost/app")?;
/// let names: Vec<(String,)> = db.query_as("SELECT name FROM users WHERE id > ?", &[&10]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Db {
    shared: Arc<Shared>,
    fmt: Formatter,
    hooks: Hooks,
    read_timeout: Duration,
    write_timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl Db {
    /// Creates the handle. Connections are dialed on first use.
    pub fn connect(opt: Options) -> Result<Self> {
        opt.validate()?;
        let pool = ConnPool::new(PoolOptions::from(&opt));
        debug!(network = %opt.network, addr = %opt.addr, database = %opt.database, "database handle created");
        Ok(Self {
            read_timeout: opt.read_timeout,
            write_timeout: opt.write_timeout,
            shared: Arc::new(Shared { opt, pool }),
            fmt: Formatter::new(),
            hooks: Hooks::default(),
            cancel: None,
        })
    }

    /// Parses a `postgres://` URL and creates the handle.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::connect(Options::parse_url(url)?)
    }

    pub fn options(&self) -> &Options {
        &self.shared.opt
    }

    pub fn pool(&self) -> &ConnPool {
        &self.shared.pool
    }

    pub fn pool_stats(&self) -> Stats {
        self.shared.pool.stats()
    }

    /// Returns a handle whose queries use `timeout` as read and write
    /// deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut db = self.clone();
        db.read_timeout = timeout;
        db.write_timeout = timeout;
        db
    }

    /// Returns a handle that resolves `?name` to `value` when the query's
    /// own named parameters don't define it.
    pub fn with_param(&self, name: &str, value: &dyn Append) -> Self {
        let mut db = self.clone();
        db.fmt = self.fmt.with_param(name, value);
        db
    }

    /// Returns a handle whose operations stop when `token` is cancelled.
    /// A running query is cancelled on the server with a CancelRequest.
    pub fn with_cancel(&self, token: CancellationToken) -> Self {
        let mut db = self.clone();
        db.cancel = Some(token);
        db
    }

    pub(crate) fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Registers a hook on this handle and the handles later derived from
    /// it. Add hooks before sharing the handle.
    pub fn add_hook(&mut self, hook: impl QueryHook + 'static) {
        self.hooks.add(Arc::new(hook));
    }

    /// Renders `query` the way `exec` would send it.
    pub fn format_query(&self, query: &str, params: &[&dyn Append]) -> Result<String> {
        self.fmt.format(query, params)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Runs a query that returns no rows (or whose rows are ignored).
    pub async fn exec(&self, query: &str, params: &[&dyn Append]) -> Result<QueryResult> {
        self.run_query(&self.shared.pool, query, params, &mut Discard, true)
            .await
    }

    /// Like [`exec`](Self::exec) but fails unless exactly one row was
    /// affected.
    pub async fn exec_one(&self, query: &str, params: &[&dyn Append]) -> Result<QueryResult> {
        let res = self.exec(query, params).await?;
        assert_one_row(res.rows_affected())?;
        Ok(res)
    }

    /// Runs a query, feeding the returned rows to `model`.
    pub async fn query(
        &self,
        model: &mut dyn Model,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<QueryResult> {
        self.run_query(&self.shared.pool, query, params, model, true)
            .await
    }

    /// Like [`query`](Self::query) but fails unless exactly one row was
    /// returned.
    pub async fn query_one(
        &self,
        model: &mut dyn Model,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<QueryResult> {
        let res = self.query(model, query, params).await?;
        assert_one_row(res.rows_returned() as i64)?;
        Ok(res)
    }

    /// Collects the returned rows.
    pub async fn query_as<T: FromRow + Send>(
        &self,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        self.query(&mut rows, query, params).await?;
        Ok(rows)
    }

    /// Returns the only row.
    pub async fn query_one_as<T: FromRow + Send>(
        &self,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<T> {
        let mut row: Option<T> = None;
        self.query_one(&mut row, query, params).await?;
        row.ok_or(Error::NoRows)
    }

    /// Runs `COPY ... FROM STDIN`, reading the data from `source`.
    pub async fn copy_from<R>(
        &self,
        source: &mut R,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<QueryResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.run_copy_from(&self.shared.pool, source, query, params)
            .await
    }

    /// Runs `COPY ... TO STDOUT`, writing the data to `sink`.
    pub async fn copy_to<W>(&self, sink: &mut W, query: &str, params: &[&dyn Append]) -> Result<QueryResult>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.run_copy_to(&self.shared.pool, sink, query, params)
            .await
    }

    /// Prepares `query` (with `$1`-style placeholders) on a connection
    /// reserved for the statement.
    pub async fn prepare(&self, query: &str) -> Result<Stmt> {
        let pool = Arc::new(StickyConnPool::new(self.shared.pool.clone()));
        Stmt::prepare(self.clone(), pool, true, query).await
    }

    /// Subscribes to `channels` on a dedicated connection.
    pub async fn listen(&self, channels: &[&str]) -> Result<Listener> {
        let listener = Listener::new(self.clone());
        if !channels.is_empty() {
            listener.listen(channels).await?;
        }
        Ok(listener)
    }

    /// Starts a transaction.
    pub async fn begin(&self) -> Result<Tx> {
        Tx::begin(self.clone()).await
    }

    /// Runs `f` in a transaction, committing when it succeeds and rolling
    /// back when it fails.
    ///
    /// ```no_run
    /// # async fn run(db: pgkit::Db) -> pgkit::Result<()> {
    /// db.run_in_transaction(|tx| {
    ///     Box::pin(async move {
    ///         tx.exec("UPDATE accounts SET balance = balance - 10 WHERE id = ?", &[&1]).await?;
    ///         tx.exec("UPDATE accounts SET balance = balance + 10 WHERE id = ?", &[&2]).await?;
    ///         Ok(())
    ///     })
    /// })
    /// .await
    /// # }
    /// ```
    pub async fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t Tx) -> BoxFuture<'t, Result<T>>,
    {
        let tx = self.begin().await?;
        match f(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "rollback after failed transaction");
                }
                Err(e)
            }
        }
    }

    /// Checks that the server answers.
    pub async fn ping(&self) -> Result<()> {
        self.exec("SELECT 1", &[]).await.map(|_| ())
    }

    /// Closes the pool. Further operations fail with
    /// [`Error::PoolClosed`].
    pub async fn close(&self) -> Result<()> {
        self.shared.pool.close().await
    }

    // ========================================================================
    // Shared machinery for Db, Tx, Stmt and Listener
    // ========================================================================

    /// Formats and runs a simple query.
    pub(crate) async fn run_query<P: Pooler>(
        &self,
        pool: &P,
        query: &str,
        params: &[&dyn Append],
        model: &mut dyn Model,
        retry: bool,
    ) -> Result<QueryResult> {
        let mut sql = Vec::with_capacity(query.len());
        if let Err(e) = self.fmt.append_query(&mut sql, query.as_bytes(), params) {
            self.report_failure(query, params, &e);
            return Err(e);
        }
        let formatted = std::str::from_utf8(&sql).ok();
        let mut ex = Exchange::Simple { query: &sql, model };
        self.run_hooked(pool, query, params, formatted, &mut ex, retry)
            .await
    }

    pub(crate) async fn run_copy_from<P, R>(
        &self,
        pool: &P,
        source: &mut R,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<QueryResult>
    where
        P: Pooler,
        R: AsyncRead + Unpin + Send,
    {
        let mut sql = Vec::with_capacity(query.len());
        if let Err(e) = self.fmt.append_query(&mut sql, query.as_bytes(), params) {
            self.report_failure(query, params, &e);
            return Err(e);
        }
        let formatted = std::str::from_utf8(&sql).ok();
        let mut ex = Exchange::CopyIn { query: &sql, source };
        // The source can't be rewound, so COPY is never retried
        self.run_hooked(pool, query, params, formatted, &mut ex, false)
            .await
    }

    pub(crate) async fn run_copy_to<P, W>(
        &self,
        pool: &P,
        sink: &mut W,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<QueryResult>
    where
        P: Pooler,
        W: AsyncWrite + Unpin + Send,
    {
        let mut sql = Vec::with_capacity(query.len());
        if let Err(e) = self.fmt.append_query(&mut sql, query.as_bytes(), params) {
            self.report_failure(query, params, &e);
            return Err(e);
        }
        let formatted = std::str::from_utf8(&sql).ok();
        let mut ex = Exchange::CopyOut { query: &sql, sink };
        self.run_hooked(pool, query, params, formatted, &mut ex, false)
            .await
    }

    fn report_failure(&self, query: &str, params: &[&dyn Append], err: &Error) {
        if self.hooks.is_empty() {
            return;
        }
        let event = QueryEvent {
            query,
            params,
            formatted: None,
            started_at: Instant::now(),
            result: None,
            error: None,
            attempts: 0,
        };
        self.hooks.before(&event);
        self.hooks.after(&QueryEvent {
            error: Some(err),
            ..event
        });
    }

    /// Runs `ex` between the before and after hooks.
    pub(crate) async fn run_hooked<P: Pooler>(
        &self,
        pool: &P,
        query: &str,
        params: &[&dyn Append],
        formatted: Option<&str>,
        ex: &mut Exchange<'_>,
        retry: bool,
    ) -> Result<QueryResult> {
        let event = QueryEvent {
            query,
            params,
            formatted,
            started_at: Instant::now(),
            result: None,
            error: None,
            attempts: 0,
        };
        if !self.hooks.is_empty() {
            self.hooks.before(&event);
        }

        let (res, attempts) = if retry {
            self.exchange_with_retry(pool, ex).await
        } else {
            (self.exchange(pool, ex).await, 1)
        };

        if !self.hooks.is_empty() {
            self.hooks.after(&QueryEvent {
                result: res.as_ref().ok(),
                error: res.as_ref().err(),
                attempts,
                ..event
            });
        }
        res
    }

    /// Runs `ex` up to `max_retries + 1` times. Returns the last result and
    /// the number of attempts.
    pub(crate) async fn exchange_with_retry<P: Pooler>(
        &self,
        pool: &P,
        ex: &mut Exchange<'_>,
    ) -> (Result<QueryResult>, u32) {
        let opt = &self.shared.opt;
        let mut attempt = 0;
        loop {
            ex.reset();
            let res = self.exchange(pool, ex).await;
            attempt += 1;

            let err = match res {
                Err(e) if attempt <= opt.max_retries && e.should_retry(opt.retry_statement_timeout) => e,
                res => return (res, attempt),
            };

            let backoff = retry_backoff(attempt - 1, opt.min_retry_backoff, opt.max_retry_backoff);
            warn!(attempt, backoff = ?backoff, error = %err, "retrying query");
            if let Err(e) = self.sleep(backoff).await {
                return (Err(e), attempt);
            }
        }
    }

    async fn sleep(&self, d: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(d) => Ok(()),
            },
            None => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }

    /// One attempt: borrow, run, release.
    pub(crate) async fn exchange<P: Pooler>(&self, pool: &P, ex: &mut Exchange<'_>) -> Result<QueryResult> {
        let mut conn = self.acquire(pool).await?;
        let res = self.run_cancellable(&mut conn, ex).await;
        release(pool, conn, &res, false).await;
        res
    }

    /// Borrows a connection, running startup on its first use.
    pub(crate) async fn acquire<P: Pooler>(&self, pool: &P) -> Result<PooledConn> {
        let mut conn = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                res = pool.get() => res?,
            },
            None => pool.get().await?,
        };

        conn.set_timeouts(self.read_timeout, self.write_timeout);
        if !conn.is_inited() {
            if let Err(e) = conn.init(&self.shared.opt).await {
                debug!(conn = conn.id(), error = %e, "connection startup failed");
                pool.remove(conn, &e).await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    /// Races `ex` against the cancellation token. On cancellation the
    /// server is asked to abort the query and the exchange gets a grace
    /// period to read the resulting error.
    async fn run_cancellable(&self, conn: &mut Conn, ex: &mut Exchange<'_>) -> Result<QueryResult> {
        let Some(token) = &self.cancel else {
            return ex.run(conn).await;
        };
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (process_id, secret_key) = (conn.process_id(), conn.secret_key());
        let fut = ex.run(conn);
        tokio::pin!(fut);

        tokio::select! {
            biased;
            res = &mut fut => return res,
            _ = token.cancelled() => {}
        }

        self.send_cancel(process_id, secret_key).await;
        match tokio::time::timeout(CANCEL_GRACE, fut).await {
            // A clean server error (usually 57014) leaves the connection
            // usable; anything else may race with the CancelRequest
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) | Err(_) => Err(Error::Cancelled),
        }
    }

    async fn send_cancel(&self, process_id: i32, secret_key: i32) {
        let res = async {
            let conn = self.shared.pool.dial().await?;
            let single = SingleConnPool::new(PooledConn::detached(conn));
            let mut conn = single.get().await?;
            conn.set_timeouts(Duration::ZERO, self.shared.opt.dial_timeout);
            let res = conn.write_cancel_request(process_id, secret_key).await;
            single.put(conn).await;
            single.close().await;
            res
        }
        .await;

        match res {
            Ok(()) => debug!(process_id, "cancel request sent"),
            Err(e) => warn!(process_id, error = %e, "failed to send cancel request"),
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("addr", &self.shared.opt.addr)
            .field("database", &self.shared.opt.database)
            .field("pool", &self.shared.pool.stats())
            .field("hooks", &self.hooks)
            .finish()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Returns a healthy connection to `pool` and discards a broken one.
pub(crate) async fn release<P: Pooler, T>(pool: &P, conn: PooledConn, res: &Result<T>, allow_timeout: bool) {
    match res {
        Err(e) if e.is_bad_conn(allow_timeout) => pool.remove(conn, e).await,
        _ => pool.put(conn).await,
    }
}

pub(crate) fn assert_one_row(n: i64) -> Result<()> {
    match n {
        0 => Err(Error::NoRows),
        n if n > 1 => Err(Error::MultiRows),
        _ => Ok(()),
    }
}

/// Backoff before retry number `retry` (zero based): a random duration
/// between half and all of `min * 2^retry`, capped at `max`.
pub(crate) fn retry_backoff(retry: u32, min: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    let ceiling = min.checked_mul(factor).map_or(max, |d| d.min(max));
    if ceiling.is_zero() {
        return ceiling;
    }
    rand::thread_rng().gen_range(ceiling / 2..=ceiling)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pg::tests::{be, Backend};
    use crate::pg::{DialFuture, Dialer, Socket};
    use crate::row::Row;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::sync::Notify;

    type Handler = Box<dyn Fn(usize, Backend) -> BoxFuture<'static, ()> + Send + Sync>;

    /// Runs a scripted backend for every dialed connection. The handler
    /// receives the dial index.
    pub(crate) struct ScriptDialer {
        pub dials: AtomicUsize,
        handler: Handler,
    }

    impl ScriptDialer {
        pub(crate) fn new<F>(handler: F) -> Arc<Self>
        where
            F: Fn(usize, Backend) -> BoxFuture<'static, ()> + Send + Sync + 'static,
        {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                handler: Box::new(handler),
            })
        }
    }

    impl Dialer for ScriptDialer {
        fn dial<'a>(&'a self, _network: &'a str, _addr: &'a str) -> DialFuture<'a> {
            Box::pin(async move {
                let (client, server) = tokio::io::duplex(64 * 1024);
                let n = self.dials.fetch_add(1, Ordering::SeqCst);
                tokio::spawn((self.handler)(n, Backend { io: server }));
                Ok(Box::new(client) as Box<dyn Socket>)
            })
        }
    }

    pub(crate) type QueryLog = Arc<Mutex<Vec<String>>>;

    pub(crate) fn query_text(body: &[u8]) -> String {
        String::from_utf8_lossy(body.strip_suffix(b"\0").unwrap_or(body)).into_owned()
    }

    /// Accepts the startup, then answers each simple query with the next
    /// reply and logs the query text.
    pub(crate) async fn answer_queries(mut backend: Backend, log: QueryLog, replies: Vec<Vec<Vec<u8>>>) {
        backend.accept_startup().await;
        for reply in replies {
            let body = backend.expect(b'Q').await;
            log.lock().push(query_text(&body));
            backend.send(&reply).await;
        }
        // Hold the socket open until the client hangs up
        let mut rest = Vec::new();
        let _ = backend.io.read_to_end(&mut rest).await;
    }

    pub(crate) fn done(tag: &str, status: u8) -> Vec<Vec<u8>> {
        vec![be::complete(tag), be::ready(status)]
    }

    pub(crate) fn failed(code: &str) -> Vec<Vec<u8>> {
        vec![be::error("ERROR", code, "boom"), be::ready(b'I')]
    }

    pub(crate) fn test_options(dialer: Arc<ScriptDialer>) -> Options {
        let mut opt = Options::new()
            .user("alice")
            .database("app")
            .pool_size(2)
            .pool_timeout(Duration::from_millis(200))
            .idle_check_frequency(Duration::ZERO)
            .retry_backoff(Duration::from_millis(1), Duration::from_millis(4));
        opt.dialer = dialer;
        opt
    }

    /// A Db whose every connection answers `replies` in order.
    pub(crate) fn scripted_db(replies: Vec<Vec<Vec<u8>>>) -> (Db, QueryLog, Arc<ScriptDialer>) {
        scripted_db_with(replies, |_| {})
    }

    pub(crate) fn scripted_db_with(
        replies: Vec<Vec<Vec<u8>>>,
        configure: impl FnOnce(&mut Options),
    ) -> (Db, QueryLog, Arc<ScriptDialer>) {
        let log = QueryLog::default();
        let handler_log = log.clone();
        let dialer = ScriptDialer::new(move |_, backend| {
            Box::pin(answer_queries(backend, handler_log.clone(), replies.clone()))
        });
        let mut opt = test_options(dialer.clone());
        configure(&mut opt);
        let db = Db::connect(opt).unwrap();
        (db, log, dialer)
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<(String, Option<String>, u32, bool)>>);

    impl QueryHook for Arc<EventLog> {
        fn after_query(&self, event: &QueryEvent<'_>) {
            self.0.lock().push((
                event.query.to_string(),
                event.formatted.map(str::to_string),
                event.attempts,
                event.error.is_some(),
            ));
        }
    }

    mod queries {
        use super::*;

        #[tokio::test]
        async fn test_query_as_tuples() {
            let (db, log, _) = scripted_db(vec![vec![
                be::row_description(&[("id", 20), ("name", 25)]),
                be::data_row(&[Some("1"), Some("ann")]),
                be::data_row(&[Some("2"), None]),
                be::complete("SELECT 2"),
                be::ready(b'I'),
            ]]);

            let rows: Vec<(i64, Option<String>)> = db
                .query_as("SELECT id, name FROM users WHERE id < ?", &[&10])
                .await
                .unwrap();

            assert_eq!(rows, vec![(1, Some("ann".to_string())), (2, None)]);
            assert_eq!(log.lock()[0], "SELECT id, name FROM users WHERE id < 10");
            assert_eq!(db.pool().idle_len(), 1);
        }

        #[tokio::test]
        async fn test_exec_one_counts() {
            let (db, _, _) = scripted_db(vec![
                done("UPDATE 1", b'I'),
                done("UPDATE 0", b'I'),
                done("UPDATE 3", b'I'),
            ]);

            let res = db.exec_one("UPDATE t SET x = 1", &[]).await.unwrap();
            assert_eq!(res.rows_affected(), 1);
            assert!(matches!(db.exec_one("UPDATE t SET x = 1", &[]).await, Err(Error::NoRows)));
            assert!(matches!(db.exec_one("UPDATE t SET x = 1", &[]).await, Err(Error::MultiRows)));
        }

        #[tokio::test]
        async fn test_query_one_no_rows() {
            let (db, _, _) = scripted_db(vec![vec![
                be::row_description(&[("s", 23)]),
                be::complete("SELECT 0"),
                be::ready(b'I'),
            ]]);

            let err = db
                .query_one_as::<(i32,)>("SELECT s FROM generate_series(1, 0) s", &[])
                .await
                .unwrap_err();
            assert!(matches!(err, Error::NoRows));
        }

        #[tokio::test]
        async fn test_query_into_rows() {
            let (db, _, _) = scripted_db(vec![vec![
                be::row_description(&[("n", 23)]),
                be::data_row(&[Some("7")]),
                be::complete("SELECT 1"),
                be::ready(b'I'),
            ]]);

            let mut rows: Vec<Row> = Vec::new();
            let res = db.query_one(&mut rows, "SELECT 7 AS n", &[]).await.unwrap();
            assert_eq!(res.rows_returned(), 1);
            assert_eq!(rows[0].get::<i32, _>("n").unwrap(), 7);
        }

        #[tokio::test]
        async fn test_server_error_keeps_connection() {
            let (db, _, dialer) = scripted_db(vec![failed("23505"), done("SELECT 1", b'I')]);

            let err = db.exec("INSERT INTO t(id) VALUES (?)", &[&1]).await.unwrap_err();
            assert!(err.as_server().unwrap().integrity_violation());

            db.ping().await.unwrap();
            assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_fatal_error_discards_connection() {
            let log = QueryLog::default();
            let handler_log = log.clone();
            let dialer = ScriptDialer::new(move |n, backend| {
                let reply = if n == 0 {
                    vec![be::error("FATAL", "57P01", "terminating connection")]
                } else {
                    done("SELECT 1", b'I')
                };
                Box::pin(answer_queries(backend, handler_log.clone(), vec![reply]))
            });
            let db = Db::connect(test_options(dialer.clone())).unwrap();

            assert!(db.ping().await.unwrap_err().is_bad_conn(false));
            assert_eq!(db.pool().len(), 0);

            db.ping().await.unwrap();
            assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn test_format_error_skips_network() {
            let (db, _, dialer) = scripted_db(vec![]);
            let err = db.exec("SELECT ?, ?", &[&1]).await.unwrap_err();
            assert!(matches!(err, Error::Format(_)));
            assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_with_param_and_format_query() {
            let (db, log, _) = scripted_db(vec![done("SELECT 1", b'I')]);
            let db = db.with_param("tenant", &"acme");

            assert_eq!(
                db.format_query("SELECT * FROM ?tenant.users", &[]).unwrap(),
                "SELECT * FROM 'acme'.users"
            );
            db.exec("SELECT ?tenant", &[]).await.unwrap();
            assert_eq!(log.lock()[0], "SELECT 'acme'");
        }

        #[tokio::test]
        async fn test_close_rejects_queries() {
            let (db, _, _) = scripted_db(vec![]);
            db.close().await.unwrap();
            assert!(matches!(db.ping().await, Err(Error::PoolClosed)));
            assert!(matches!(db.close().await, Err(Error::PoolClosed)));
        }
    }

    mod retries {
        use super::*;

        #[tokio::test]
        async fn test_retries_serialization_failures() {
            let (mut db, log, _) = scripted_db_with(
                vec![failed("40001"), failed("40001"), done("UPDATE 1", b'I')],
                |opt| opt.max_retries = 2,
            );
            let events = Arc::new(EventLog::default());
            db.add_hook(events.clone());

            let res = db.exec("UPDATE t SET x = 1", &[]).await.unwrap();
            assert_eq!(res.rows_affected(), 1);
            assert_eq!(log.lock().len(), 3);

            let events = events.0.lock();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].2, 3);
            assert!(!events[0].3);
        }

        #[tokio::test]
        async fn test_gives_up_after_max_retries() {
            let (db, log, _) = scripted_db_with(
                vec![failed("40001"), failed("40001"), failed("40001")],
                |opt| opt.max_retries = 1,
            );

            let err = db.exec("UPDATE t SET x = 1", &[]).await.unwrap_err();
            assert_eq!(err.as_server().unwrap().code(), "40001");
            assert_eq!(log.lock().len(), 2);
        }

        #[tokio::test]
        async fn test_no_retry_for_constraint_errors() {
            let (db, log, _) = scripted_db_with(
                vec![failed("23505"), done("INSERT 0 1", b'I')],
                |opt| opt.max_retries = 3,
            );

            assert!(db.exec("INSERT INTO t VALUES (1)", &[]).await.is_err());
            assert_eq!(log.lock().len(), 1);
        }

        #[test]
        fn test_retry_backoff_bounds() {
            let min = Duration::from_millis(100);
            let max = Duration::from_secs(1);
            for retry in 0..40 {
                let ceiling = (min * 2u32.saturating_pow(retry.min(20))).min(max);
                let d = retry_backoff(retry, min, max);
                assert!(d <= ceiling && d >= ceiling / 2, "retry {}: {:?}", retry, d);
            }
            assert_eq!(retry_backoff(3, Duration::ZERO, Duration::ZERO), Duration::ZERO);
        }
    }

    mod hooks {
        use super::*;

        #[tokio::test]
        async fn test_hooks_see_formatted_query() {
            let (mut db, _, _) = scripted_db(vec![done("SELECT 1", b'I'), failed("42P01")]);
            let events = Arc::new(EventLog::default());
            db.add_hook(events.clone());

            db.exec("SELECT ?", &[&"x"]).await.unwrap();
            db.exec("SELECT * FROM missing", &[]).await.unwrap_err();
            db.exec("SELECT ?", &[]).await.unwrap_err();

            let events = events.0.lock();
            assert_eq!(
                events[0],
                ("SELECT ?".to_string(), Some("SELECT 'x'".to_string()), 1, false)
            );
            assert!(events[1].3);
            // Formatting failed before any attempt
            assert_eq!(events[2], ("SELECT ?".to_string(), None, 0, true));
        }
    }

    mod cancel {
        use super::*;

        #[tokio::test]
        async fn test_cancel_sends_cancel_request() {
            let query_arrived = Arc::new(Notify::new());
            let cancel_arrived = Arc::new(Notify::new());
            let cancel_body = Arc::new(Mutex::new(Vec::new()));

            let dialer = {
                let query_arrived = query_arrived.clone();
                let cancel_arrived = cancel_arrived.clone();
                let cancel_body = cancel_body.clone();
                ScriptDialer::new(move |n, mut backend| {
                    let query_arrived = query_arrived.clone();
                    let cancel_arrived = cancel_arrived.clone();
                    let cancel_body = cancel_body.clone();
                    Box::pin(async move {
                        if n == 1 {
                            *cancel_body.lock() = backend.read_untyped().await;
                            cancel_arrived.notify_one();
                            return;
                        }
                        backend.accept_startup().await;
                        backend.expect(b'Q').await;
                        query_arrived.notify_one();
                        cancel_arrived.notified().await;
                        backend
                            .send(&[
                                be::error("ERROR", "57014", "canceling statement due to user request"),
                                be::ready(b'I'),
                            ])
                            .await;
                        let mut rest = Vec::new();
                        let _ = backend.io.read_to_end(&mut rest).await;
                    })
                })
            };

            let token = CancellationToken::new();
            let db = Db::connect(test_options(dialer)).unwrap().with_cancel(token.clone());

            let query = tokio::spawn({
                let db = db.clone();
                async move { db.exec("SELECT pg_sleep(60)", &[]).await }
            });
            query_arrived.notified().await;
            token.cancel();

            let err = query.await.unwrap().unwrap_err();
            assert_eq!(err.as_server().unwrap().code(), "57014");

            let body = cancel_body.lock().clone();
            let mut expected = 80877102i32.to_be_bytes().to_vec();
            expected.extend_from_slice(&42i32.to_be_bytes());
            expected.extend_from_slice(&7i32.to_be_bytes());
            assert_eq!(body, expected);

            // The server error left the connection in a clean state
            assert_eq!(db.pool().idle_len(), 1);
        }

        #[tokio::test]
        async fn test_cancelled_token_fails_fast() {
            let (db, _, dialer) = scripted_db(vec![]);
            let token = CancellationToken::new();
            token.cancel();

            let err = db.with_cancel(token).ping().await.unwrap_err();
            assert!(matches!(err, Error::Cancelled));
            assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        }
    }
}
