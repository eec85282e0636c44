//! Transactions and savepoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::db::{assert_one_row, Db};
use crate::error::{Error, Result};
use crate::format::Ident;
use crate::pool::StickyConnPool;
use crate::row::{Discard, FromRow, Model, QueryResult};
use crate::stmt::Stmt;
use crate::types::Append;
use crate::BoxFuture;

/// A transaction pinned to one connection.
///
/// Every operation after [`commit`](Tx::commit) or
/// [`rollback`](Tx::rollback) fails with [`Error::TxDone`]. A transaction
/// dropped while still open is rolled back in the background.
pub struct Tx {
    db: Db,
    pool: Arc<StickyConnPool>,
    done: AtomicBool,
}

impl Tx {
    pub(crate) async fn begin(db: Db) -> Result<Self> {
        let pool = Arc::new(StickyConnPool::new(db.pool().clone()));
        let tx = Self {
            db,
            pool,
            done: AtomicBool::new(false),
        };

        // BEGIN is the only statement that may be retried on a new
        // connection
        if let Err(e) = tx.db.run_query(&*tx.pool, "BEGIN", &[], &mut Discard, true).await {
            tx.done.store(true, Ordering::Release);
            let _ = tx.pool.close().await;
            return Err(e);
        }
        Ok(tx)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_done() {
            return Err(Error::TxDone);
        }
        Ok(())
    }

    pub async fn exec(&self, query: &str, params: &[&dyn Append]) -> Result<QueryResult> {
        self.check()?;
        self.db
            .run_query(&*self.pool, query, params, &mut Discard, false)
            .await
    }

    pub async fn exec_one(&self, query: &str, params: &[&dyn Append]) -> Result<QueryResult> {
        let res = self.exec(query, params).await?;
        assert_one_row(res.rows_affected())?;
        Ok(res)
    }

    pub async fn query(
        &self,
        model: &mut dyn Model,
        query: &str,
        params: &[&dyn Append],
    ) -> Result<QueryResult> {
        self.check()?;
        self.db
            .run_query(&*self.pool, query, params, model, false)
            .await
    }

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

    pub async fn query_as<T: FromRow + Send>(&self, query: &str, params: &[&dyn Append]) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        self.query(&mut rows, query, params).await?;
        Ok(rows)
    }

    pub async fn query_one_as<T: FromRow + Send>(&self, query: &str, params: &[&dyn Append]) -> Result<T> {
        let mut row: Option<T> = None;
        self.query_one(&mut row, query, params).await?;
        row.ok_or(Error::NoRows)
    }

    pub async fn copy_from<R>(&self, source: &mut R, query: &str, params: &[&dyn Append]) -> Result<QueryResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check()?;
        self.db
            .run_copy_from(&*self.pool, source, query, params)
            .await
    }

    pub async fn copy_to<W>(&self, sink: &mut W, query: &str, params: &[&dyn Append]) -> Result<QueryResult>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.check()?;
        self.db
            .run_copy_to(&*self.pool, sink, query, params)
            .await
    }

    /// Prepares `query` on the transaction's connection.
    pub async fn prepare(&self, query: &str) -> Result<Stmt> {
        self.check()?;
        Stmt::prepare(self.db.clone(), self.pool.clone(), false, query).await
    }

    /// Prepares an existing statement on the transaction's connection.
    pub async fn stmt(&self, stmt: &Stmt) -> Result<Stmt> {
        self.prepare(stmt.sql()).await
    }

    // ========================================================================
    // Completion
    // ========================================================================

    pub async fn commit(&self) -> Result<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, query: &str) -> Result<()> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(Error::TxDone);
        }
        let res = self
            .db
            .run_query(&*self.pool, query, &[], &mut Discard, false)
            .await;
        let _ = self.pool.close().await;
        res.map(|_| ())
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    pub async fn savepoint(&self, name: &str) -> Result<()> {
        self.exec("SAVEPOINT ?", &[&Ident(name)]).await.map(|_| ())
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.exec("ROLLBACK TO SAVEPOINT ?", &[&Ident(name)])
            .await
            .map(|_| ())
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.exec("RELEASE SAVEPOINT ?", &[&Ident(name)])
            .await
            .map(|_| ())
    }

    /// Runs `f` inside a savepoint, releasing it when `f` succeeds and
    /// rolling back to it when `f` fails. The transaction stays open
    /// either way.
    pub async fn run_in_savepoint<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t Tx) -> BoxFuture<'t, Result<T>>,
    {
        self.savepoint(name).await?;
        match f(self).await {
            Ok(value) => {
                self.release_savepoint(name).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback_to_savepoint(name).await {
                    debug!(savepoint = name, error = %rollback, "rollback to savepoint failed");
                }
                Err(e)
            }
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Dropping the connection ends the session, which rolls back
            return;
        };
        warn!("transaction dropped while open, rolling back");
        let db = self.db.clone();
        let pool = self.pool.clone();
        handle.spawn(async move {
            if let Err(e) = db.run_query(&*pool, "ROLLBACK", &[], &mut Discard, false).await {
                debug!(error = %e, "rollback of dropped transaction failed");
            }
            let _ = pool.close().await;
        });
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("conn", &self.pool.conn_id())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pooler;
    use crate::db::tests::{done, failed, scripted_db};
    use std::time::Duration;

    #[tokio::test]
    async fn test_commit() {
        let (db, log, _) = scripted_db(vec![
            done("BEGIN", b'T'),
            done("INSERT 0 1", b'T'),
            done("COMMIT", b'I'),
        ]);

        let tx = db.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES (?)", &[&1]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(*log.lock(), vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]);
        assert!(matches!(tx.exec("SELECT 1", &[]).await, Err(Error::TxDone)));
        assert!(matches!(tx.rollback().await, Err(Error::TxDone)));
        assert_eq!(db.pool().idle_len(), 1);
    }

    #[tokio::test]
    async fn test_run_in_transaction_rolls_back_on_error() {
        let (db, log, _) = scripted_db(vec![
            done("BEGIN", b'T'),
            failed("23505"),
            done("ROLLBACK", b'I'),
        ]);

        let err = db
            .run_in_transaction(|tx| {
                Box::pin(async move {
                    tx.exec("INSERT INTO t VALUES (1)", &[]).await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.as_server().unwrap().code(), "23505");
        assert_eq!(log.lock().last().unwrap(), "ROLLBACK");
    }

    #[tokio::test]
    async fn test_run_in_transaction_commits() {
        let (db, log, _) = scripted_db(vec![
            done("BEGIN", b'T'),
            done("UPDATE 2", b'T'),
            done("COMMIT", b'I'),
        ]);

        let n = db
            .run_in_transaction(|tx| {
                Box::pin(async move { Ok(tx.exec("UPDATE t SET x = 1", &[]).await?.rows_affected()) })
            })
            .await
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(log.lock().last().unwrap(), "COMMIT");
    }

    #[tokio::test]
    async fn test_savepoints() {
        let (db, log, _) = scripted_db(vec![
            done("BEGIN", b'T'),
            done("SAVEPOINT", b'T'),
            failed("23505"),
            done("ROLLBACK", b'T'),
            done("COMMIT", b'I'),
        ]);

        let tx = db.begin().await.unwrap();
        let res: Result<()> = tx
            .run_in_savepoint("sp1", |tx| {
                Box::pin(async move {
                    tx.exec("INSERT INTO t VALUES (1)", &[]).await?;
                    Ok(())
                })
            })
            .await;
        assert!(res.is_err());
        tx.commit().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "BEGIN",
                "SAVEPOINT \"sp1\"",
                "INSERT INTO t VALUES (1)",
                "ROLLBACK TO SAVEPOINT \"sp1\"",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let (db, log, _) = scripted_db(vec![done("BEGIN", b'T'), done("ROLLBACK", b'I')]);

        let tx = db.begin().await.unwrap();
        drop(tx);

        for _ in 0..50 {
            if db.pool().idle_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*log.lock(), vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(db.pool().idle_len(), 1);
    }
}
