//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, Bytes};

use super::buffer::WriteBuffer;
use crate::error::{Error, Result};
use crate::types::{Append, Flags, Oid};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Request code sent instead of a protocol version to ask for TLS.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Request code of a CancelRequest.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self, wb: &mut WriteBuffer);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub user: &'a str,
    pub database: &'a str,
    pub params: Vec<(&'a str, &'a str)>,
}

impl FrontendMessage for StartupMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_untyped_message();
        wb.write_int32(PROTOCOL_VERSION);

        wb.write_string("user");
        wb.write_string(self.user);
        wb.write_string("database");
        wb.write_string(self.database);

        for (key, value) in &self.params {
            wb.write_string(key);
            wb.write_string(value);
        }

        // Terminator
        wb.write_byte(0);
        wb.finish_message();
    }
}

/// SSLRequest, answered by a single `S` or `N` byte.
#[derive(Debug, Clone, Copy)]
pub struct SslRequestMessage;

impl FrontendMessage for SslRequestMessage {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_untyped_message();
        wb.write_int32(SSL_REQUEST_CODE);
        wb.finish_message();
    }
}

/// CancelRequest, sent on a fresh connection. The server never replies.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_untyped_message();
        wb.write_int32(CANCEL_REQUEST_CODE);
        wb.write_int32(self.process_id);
        wb.write_int32(self.secret_key);
        wb.finish_message();
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'p');
        wb.write_string(self.password);
        wb.finish_message();
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: &'a str,
    /// Initial client response data
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'p');
        wb.write_string(self.mechanism);
        wb.write_len32(self.data.len(), "SASL response length");
        wb.write_bytes(self.data);
        wb.finish_message();
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'p');
        wb.write_bytes(self.data);
        wb.finish_message();
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a [u8],
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'Q');
        wb.write_bytes_string(self.query);
        wb.finish_message();
    }
}

/// Parse message ('P') - Creates a prepared statement
///
/// Parameter types are left for the server to infer.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'P');
        wb.write_string(self.name);
        wb.write_string(self.query);
        wb.write_int16(0);
        wb.finish_message();
    }
}

/// Bind message ('B') - Binds text-format parameters to a prepared statement
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [&'a dyn Append],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'B');
        wb.write_string(self.portal);
        wb.write_string(self.statement);

        // No parameter format codes: everything is text
        wb.write_int16(0);

        wb.write_count16(self.params.len(), "parameters");
        let mut scratch = Vec::new();
        for param in self.params {
            wb.start_param();
            if param.is_null() {
                wb.finish_null_param();
                continue;
            }
            scratch.clear();
            param.append_value(&mut scratch, Flags::NONE);
            wb.write_bytes(&scratch);
            wb.finish_param();
        }

        // No result format codes: text results
        wb.write_int16(0);
        wb.finish_message();
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'E');
        wb.write_string(self.portal);
        wb.write_int32(self.max_rows);
        wb.finish_message();
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'D');
        wb.write_byte(self.kind);
        wb.write_string(self.name);
        wb.finish_message();
    }
}

/// Close message ('C') - Closes a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'C');
        wb.write_byte(self.kind);
        wb.write_string(self.name);
        wb.finish_message();
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'S');
        wb.finish_message();
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'H');
        wb.finish_message();
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'X');
        wb.finish_message();
    }
}

/// CopyData ('d') - One chunk of COPY FROM STDIN input
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'd');
        wb.write_bytes(self.data);
        wb.finish_message();
    }
}

/// CopyDone ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'c');
        wb.finish_message();
    }
}

/// CopyFail ('f') - Aborts COPY FROM STDIN with an error message
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub message: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self, wb: &mut WriteBuffer) {
        wb.start_message(b'f');
        wb.write_string(self.message);
        wb.finish_message();
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },
    /// Kerberos, GSSAPI, SSPI and anything newer.
    AuthenticationUnsupported { code: i32 },

    // Query responses
    RowDescription { columns: Vec<ColumnInfo> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: Bytes },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // COPY
    CopyInResponse,
    CopyOutResponse,
    CopyData { data: Bytes },
    CopyDone,

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode a backend message from its type byte and body (the bytes after
    /// the length field).
    pub fn decode(kind: u8, body: Bytes) -> Result<Self> {
        match kind {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: strip_nul(body),
            }),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            b'G' => Ok(BackendMessage::CopyInResponse),
            b'H' => Ok(BackendMessage::CopyOutResponse),
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            _ => Err(Error::Protocol(format!(
                "unknown message type: {:?}",
                kind as char
            ))),
        }
    }

    /// Short name for log and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password { .. }
            | BackendMessage::AuthenticationSASL { .. }
            | BackendMessage::AuthenticationSASLContinue { .. }
            | BackendMessage::AuthenticationSASLFinal { .. }
            | BackendMessage::AuthenticationUnsupported { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::CopyInResponse => "CopyInResponse",
            BackendMessage::CopyOutResponse => "CopyOutResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        ensure(&body, 4)?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                ensure(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            code => Ok(BackendMessage::AuthenticationUnsupported { code }),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        ensure(&body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut columns = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            ensure(&body, 18)?;
            let table_oid = body.get_u32();
            let column_attr = body.get_i16();
            let type_oid = Oid(body.get_u32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = if body.get_i16() == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            columns.push(ColumnInfo {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { columns })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        ensure(&body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            ensure(&body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                ensure(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_ready_for_query(mut body: Bytes) -> Result<Self> {
        ensure(&body, 1)?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> Result<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> Result<Self> {
        ensure(&body, 8)?;
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        ensure(&body, 2)?;
        let num_params = body.get_i16().max(0) as usize;
        ensure(&body, num_params * 4)?;
        let type_oids = (0..num_params).map(|_| Oid(body.get_u32())).collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> Result<Self> {
        ensure(&body, 4)?;
        let process_id = body.get_i32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn ensure(body: &Bytes, n: usize) -> Result<()> {
    if body.remaining() < n {
        return Err(Error::Protocol("message body is too short".to_string()));
    }
    Ok(())
}

fn strip_nul(mut body: Bytes) -> Bytes {
    if body.last() == Some(&0) {
        body.truncate(body.len() - 1);
    }
    body
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("missing null terminator in string".to_string()))?;

    let s = match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(&buf[..end]).into_owned(),
    };

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
