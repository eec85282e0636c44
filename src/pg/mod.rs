//! PostgreSQL wire protocol implementation.
//!
//! Architecture:
//! - `buffer`: framed outgoing messages
//! - `reader`: deadline-aware buffered input
//! - `protocol`: low-level wire protocol encoding/decoding
//! - `scram`: SCRAM-SHA-256 authentication
//! - `stream`: sockets, TLS and the dialer
//! - `connection`: connection state machine and protocol exchanges

pub mod buffer;
pub mod connection;
pub mod protocol;
pub mod reader;
pub mod scram;
pub mod stream;


pub use buffer::WriteBuffer;
pub use connection::{Conn, Notification};
pub use protocol::{ColumnInfo, Format, TransactionStatus};
pub use reader::Reader;
pub use stream::{insecure_tls_config, DefaultDialer, DialFuture, Dialer, Socket, Stream};
