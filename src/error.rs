//! Error types for pgkit.
//!
//! Every fallible operation returns [`Error`]. Server-reported failures keep
//! the complete ErrorResponse field map in [`PgError`].

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while talking to PostgreSQL.
#[derive(Error, Debug)]
pub enum Error {
    /// The server answered with an ErrorResponse.
    #[error(transparent)]
    Server(#[from] PgError),

    /// A single-row operation matched no rows.
    #[error("pg: no rows in result set")]
    NoRows,

    /// A single-row operation matched more than one row.
    #[error("pg: multiple rows in result set")]
    MultiRows,

    /// Waiting for a free connection took longer than the pool timeout.
    #[error("pg: connection pool timeout")]
    PoolTimeout,

    #[error("pg: database is closed")]
    PoolClosed,

    #[error("pg: transaction has already been committed or rolled back")]
    TxDone,

    #[error("pg: statement is closed")]
    StmtClosed,

    #[error("pg: listener is closed")]
    ListenerClosed,

    #[error("pg: SSL is not enabled on the server")]
    SslNotSupported,

    /// Socket failure, including read/write deadlines and EOF.
    #[error("pg: I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backend sent something the client does not understand.
    #[error("pg: protocol error: {0}")]
    Protocol(String),

    #[error("pg: authentication failed: {0}")]
    Auth(String),

    /// The query template could not be expanded.
    #[error("pg: {0}")]
    Format(String),

    #[error("pg: unsupported type: {0}")]
    UnsupportedType(String),

    /// A column value could not be scanned into the requested type.
    #[error("pg: can't decode column: {0}")]
    Decode(String),

    #[error("pg: invalid options: {0}")]
    Config(String),

    /// The operation was cancelled through its cancellation token.
    #[error("pg: operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns the server error, if this is one.
    pub fn as_server(&self) -> Option<&PgError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// Reports whether the connection that produced this error must be
    /// discarded instead of being returned to the pool.
    ///
    /// With `allow_timeout` set, deadline expiry does not poison the
    /// connection (used when waiting for notifications).
    pub fn is_bad_conn(&self, allow_timeout: bool) -> bool {
        match self {
            Error::Server(e) => {
                e.is_fatal() || matches!(e.code(), "57P01" | "57P02" | "57P03")
            }
            Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => !allow_timeout,
            Error::Io(_)
            | Error::Protocol(_)
            | Error::Auth(_)
            | Error::SslNotSupported
            | Error::Cancelled => true,
            Error::NoRows
            | Error::MultiRows
            | Error::PoolTimeout
            | Error::PoolClosed
            | Error::TxDone
            | Error::StmtClosed
            | Error::ListenerClosed
            | Error::Format(_)
            | Error::UnsupportedType(_)
            | Error::Decode(_)
            | Error::Config(_) => false,
        }
    }

    /// Reports whether an operation that failed with this error may be
    /// attempted again.
    pub fn should_retry(&self, retry_statement_timeout: bool) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::TimedOut
            ),
            Error::Server(e) => match e.code() {
                // serialization_failure, too_many_connections, lock_not_available
                "40001" | "53300" | "55000" => true,
                // query_canceled
                "57014" => retry_statement_timeout,
                _ => false,
            },
            _ => false,
        }
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// An ErrorResponse (or NoticeResponse) sent by the server.
///
/// Fields are keyed by their single-byte protocol codes: `S` severity,
/// `C` SQLSTATE, `M` message, `D` detail, `H` hint and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgError {
    fields: HashMap<u8, String>,
}

impl PgError {
    pub fn new(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    /// Returns the raw field for the given protocol code.
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(String::as_str)
    }

    pub fn fields(&self) -> &HashMap<u8, String> {
        &self.fields
    }

    /// Severity, preferring the non-localized `V` field.
    pub fn severity(&self) -> &str {
        self.field(b'V')
            .or_else(|| self.field(b'S'))
            .unwrap_or_default()
    }

    /// Five-character SQLSTATE code.
    pub fn code(&self) -> &str {
        self.field(b'C').unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.field(b'M').unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(b'H')
    }

    /// FATAL and PANIC errors end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC")
    }

    /// Class 23: integrity constraint violation.
    pub fn integrity_violation(&self) -> bool {
        self.code().starts_with("23")
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} {}",
            self.field(b'S').unwrap_or("ERROR"),
            self.code(),
            self.message()
        )?;
        if let Some(d) = self.detail() {
            write!(f, " (DETAIL: {})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for PgError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(severity: &str, code: &str) -> Error {
        let mut fields = HashMap::new();
        fields.insert(b'S', severity.to_string());
        fields.insert(b'C', code.to_string());
        fields.insert(b'M', "boom".to_string());
        Error::Server(PgError::new(fields))
    }

    #[test]
    fn test_server_error_display() {
        let err = server_error("ERROR", "23505");
        assert_eq!(err.to_string(), "ERROR #23505 boom");
        assert!(err.as_server().unwrap().integrity_violation());
    }

    #[test]
    fn test_bad_conn_classification() {
        // Plain SQL errors leave the connection usable
        assert!(!server_error("ERROR", "42P01").is_bad_conn(false));
        assert!(server_error("FATAL", "28P01").is_bad_conn(false));
        assert!(server_error("ERROR", "57P01").is_bad_conn(false));

        assert!(!Error::Format("expected 1 parameters, got 0".into()).is_bad_conn(false));
        assert!(!Error::NoRows.is_bad_conn(false));
        assert!(Error::Io(io::ErrorKind::UnexpectedEof.into()).is_bad_conn(false));

        let timeout = Error::Io(io::ErrorKind::TimedOut.into());
        assert!(timeout.is_bad_conn(false));
        assert!(!timeout.is_bad_conn(true));
    }

    #[test]
    fn test_retry_classification() {
        assert!(server_error("ERROR", "40001").should_retry(false));
        assert!(server_error("ERROR", "53300").should_retry(false));
        assert!(server_error("ERROR", "55000").should_retry(false));
        assert!(!server_error("ERROR", "57014").should_retry(false));
        assert!(server_error("ERROR", "57014").should_retry(true));
        assert!(!server_error("ERROR", "23505").should_retry(true));

        assert!(Error::Io(io::ErrorKind::UnexpectedEof.into()).should_retry(false));
        assert!(Error::Io(io::ErrorKind::TimedOut.into()).should_retry(false));
        assert!(!Error::Io(io::ErrorKind::ConnectionRefused.into()).should_retry(false));
        assert!(!Error::Cancelled.should_retry(true));
    }
}
