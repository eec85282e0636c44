//! pgkit - an async PostgreSQL client.
//!
//! Speaks the v3 wire protocol over TCP, unix sockets or TLS and provides a
//! connection pool, a client-side query formatter, transactions, prepared
//! statements, COPY and LISTEN/NOTIFY.
//!
//! ```no_run
//! # async fn run() -> pgkit::Result<()> {
//! let db = pgkit::Db::from_url("postgres://postgres@localhost/app")?;
//! let names: Vec<(String,)> = db
//!     .query_as("SELECT name FROM users WHERE id > ?", &[&10])
//!     .await?;
//! # Ok(())
//! # }
//! ```

extern crate self as pgkit;

use std::future::Future;
use std::pin::Pin;

mod db;
mod error;
pub mod format;
mod hook;
mod listener;
mod options;
pub mod pg;
pub mod pool;
mod row;
mod stmt;
mod tx;
pub mod types;

pub use db::Db;
pub use error::{Error, PgError, Result};
pub use format::{Formatter, Ident, In, Q};
pub use hook::{QueryEvent, QueryHook};
pub use listener::Listener;
pub use options::{Options, SslMode};
pub use pg::{ColumnInfo, Notification, TransactionStatus};
pub use pool::{ConnPool, Pooler, Stats};
pub use row::{Discard, FromRow, Model, QueryResult, Row, RowIndex, SharedColumns};
pub use stmt::Stmt;
pub use tx::Tx;
pub use types::{Append, Array, Hstore, Json, Named, Scan, Value};

#[cfg(feature = "macros")]
pub use pgkit_macros::{FromRow, Params};

/// Boxed future returned by transaction and savepoint closures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
