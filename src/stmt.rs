//! Prepared statements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::db::{assert_one_row, Db, Exchange};
use crate::error::{Error, Result};
use crate::pg::Conn;
use crate::pool::StickyConnPool;
use crate::row::{Discard, FromRow, Model, QueryResult, SharedColumns};
use crate::types::Append;

/// Server-side name and result columns of a statement, valid on the
/// connection `conn_id`.
#[derive(Debug)]
pub(crate) struct StmtState {
    name: String,
    columns: SharedColumns,
    /// Zero until the statement is prepared.
    conn_id: u64,
}

impl StmtState {
    fn new() -> Self {
        Self {
            name: String::new(),
            columns: Arc::from(Vec::new()),
            conn_id: 0,
        }
    }

    pub(crate) async fn prepare(&mut self, conn: &mut Conn, query: &str) -> Result<()> {
        let name = conn.next_id();
        let columns = conn.prepare(&name, query).await?;
        if self.conn_id != 0 {
            debug!(conn = conn.id(), statement = %name, "statement prepared on new connection");
        }
        self.name = name;
        self.columns = columns;
        self.conn_id = conn.id();
        Ok(())
    }

    /// Executes the statement, preparing it again when the pinned
    /// connection was replaced.
    pub(crate) async fn exec(
        &mut self,
        conn: &mut Conn,
        query: &str,
        params: &[&dyn Append],
        model: &mut dyn Model,
    ) -> Result<QueryResult> {
        if self.conn_id != conn.id() {
            self.prepare(conn, query).await?;
        }
        conn.exec_prepared(&self.name, &self.columns, params, model)
            .await
    }

    pub(crate) async fn close(&self, conn: &mut Conn) -> Result<()> {
        // A statement prepared on a replaced connection died with it
        if self.conn_id != conn.id() {
            return Ok(());
        }
        conn.close_statement(&self.name).await
    }
}

/// A statement prepared on a pinned connection.
///
/// Uses `$1`-style placeholders; parameters are sent with Bind instead of
/// being formatted into the query.
pub struct Stmt {
    db: Db,
    pool: Arc<StickyConnPool>,
    /// Statements of a transaction share its pool and leave it open.
    owns_pool: bool,
    query: String,
    state: Mutex<StmtState>,
    closed: AtomicBool,
}

impl Stmt {
    pub(crate) async fn prepare(db: Db, pool: Arc<StickyConnPool>, owns_pool: bool, query: &str) -> Result<Self> {
        let mut state = StmtState::new();
        let mut ex = Exchange::Prepare {
            query,
            state: &mut state,
        };
        let res = if owns_pool {
            db.exchange_with_retry(&*pool, &mut ex).await.0
        } else {
            db.exchange(&*pool, &mut ex).await
        };
        if let Err(e) = res {
            if owns_pool {
                let _ = pool.close().await;
            }
            return Err(e);
        }

        Ok(Self {
            db,
            pool,
            owns_pool,
            query: query.to_string(),
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
        })
    }

    /// The statement's SQL.
    pub fn sql(&self) -> &str {
        &self.query
    }

    pub async fn columns(&self) -> SharedColumns {
        self.state.lock().await.columns.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn run(&self, params: &[&dyn Append], model: &mut dyn Model) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(Error::StmtClosed);
        }
        let mut state = self.state.lock().await;
        let mut ex = Exchange::Stmt {
            query: &self.query,
            state: &mut *state,
            params,
            model,
        };
        // Inside a transaction a retry would run on a rolled back session
        self.db
            .run_hooked(&*self.pool, &self.query, params, None, &mut ex, self.owns_pool)
            .await
    }

    pub async fn exec(&self, params: &[&dyn Append]) -> Result<QueryResult> {
        self.run(params, &mut Discard).await
    }

    /// Fails unless exactly one row was affected.
    pub async fn exec_one(&self, params: &[&dyn Append]) -> Result<QueryResult> {
        let res = self.exec(params).await?;
        assert_one_row(res.rows_affected())?;
        Ok(res)
    }

    pub async fn query(&self, model: &mut dyn Model, params: &[&dyn Append]) -> Result<QueryResult> {
        self.run(params, model).await
    }

    /// Fails unless exactly one row was returned.
    pub async fn query_one(&self, model: &mut dyn Model, params: &[&dyn Append]) -> Result<QueryResult> {
        let res = self.query(model, params).await?;
        assert_one_row(res.rows_returned() as i64)?;
        Ok(res)
    }

    pub async fn query_as<T: FromRow + Send>(&self, params: &[&dyn Append]) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        self.query(&mut rows, params).await?;
        Ok(rows)
    }

    pub async fn query_one_as<T: FromRow + Send>(&self, params: &[&dyn Append]) -> Result<T> {
        let mut row: Option<T> = None;
        self.query_one(&mut row, params).await?;
        row.ok_or(Error::NoRows)
    }

    /// Deallocates the statement on the server and releases its connection.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::StmtClosed);
        }
        let res = {
            let state = self.state.lock().await;
            let mut ex = Exchange::CloseStmt { state: &*state };
            self.db.exchange(&*self.pool, &mut ex).await.map(|_| ())
        };
        if self.owns_pool {
            let _ = self.pool.close().await;
        }
        res
    }
}

impl Drop for Stmt {
    fn drop(&mut self) {
        if !self.owns_pool || self.is_closed() {
            return;
        }
        // The server frees the statement with the session; hand the
        // connection back so it isn't lost
        let pool = self.pool.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = pool.close().await;
            });
        }
    }
}

impl std::fmt::Debug for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stmt")
            .field("query", &self.query)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pooler;
    use crate::db::tests::{test_options, ScriptDialer};
    use crate::pg::tests::{be, Backend};
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncReadExt;

    async fn answer_prepare(backend: &mut Backend) -> Vec<u8> {
        let parse = backend.expect(b'P').await;
        backend.expect(b'D').await;
        backend.expect(b'S').await;
        backend
            .send(&[
                be::msg(b'1', &[]),
                be::msg(b't', &[0, 1, 0, 0, 0, 20]),
                be::row_description(&[("name", 25)]),
                be::ready(b'I'),
            ])
            .await;
        parse
    }

    async fn answer_exec(backend: &mut Backend, reply: Vec<Vec<u8>>) -> Vec<u8> {
        let bind = backend.expect(b'B').await;
        backend.expect(b'E').await;
        backend.expect(b'S').await;
        backend.send(&reply).await;
        bind
    }

    fn one_row(name: &str) -> Vec<Vec<u8>> {
        vec![
            be::msg(b'2', &[]),
            be::data_row(&[Some(name)]),
            be::complete("SELECT 1"),
            be::ready(b'I'),
        ]
    }

    #[tokio::test]
    async fn test_prepare_exec_close() {
        let dialer = ScriptDialer::new(|_, mut backend| {
            Box::pin(async move {
                backend.accept_startup().await;
                let parse = answer_prepare(&mut backend).await;
                assert!(parse.starts_with(b"1\0SELECT name FROM users WHERE id = $1\0"));
                answer_exec(&mut backend, one_row("ann")).await;

                let close = backend.expect(b'C').await;
                assert_eq!(close, b"S1\0");
                backend.expect(b'H').await;
                backend.send(&[be::msg(b'3', &[])]).await;
                let mut rest = Vec::new();
                let _ = backend.io.read_to_end(&mut rest).await;
            })
        });
        let db = Db::connect(test_options(dialer)).unwrap();

        let stmt = db.prepare("SELECT name FROM users WHERE id = $1").await.unwrap();
        assert_eq!(stmt.columns().await[0].name, "name");

        let (name,): (String,) = stmt.query_one_as(&[&1]).await.unwrap();
        assert_eq!(name, "ann");

        stmt.close().await.unwrap();
        assert!(matches!(stmt.exec(&[&1]).await, Err(Error::StmtClosed)));
        assert!(matches!(stmt.close().await, Err(Error::StmtClosed)));
        // The pinned connection went back to the pool
        assert_eq!(db.pool().idle_len(), 1);
    }

    #[tokio::test]
    async fn test_reprepares_after_connection_loss() {
        let dialer = ScriptDialer::new(|n, mut backend| {
            Box::pin(async move {
                backend.accept_startup().await;
                answer_prepare(&mut backend).await;
                if n == 0 {
                    backend.expect(b'B').await;
                    // Hang up mid-statement
                    return;
                }
                answer_exec(&mut backend, one_row("bob")).await;
                let mut rest = Vec::new();
                let _ = backend.io.read_to_end(&mut rest).await;
            })
        });
        let db = Db::connect(test_options(dialer.clone())).unwrap();

        let stmt = db.prepare("SELECT name FROM users WHERE id = $1").await.unwrap();
        let err = stmt.exec(&[&1]).await.unwrap_err();
        assert!(err.is_bad_conn(false));

        let names: Vec<(String,)> = stmt.query_as(&[&2]).await.unwrap();
        assert_eq!(names, vec![("bob".to_string(),)]);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }
}
