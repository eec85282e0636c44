//! PostgreSQL connection implementation.
//!
//! A [`Conn`] owns one socket and runs the protocol exchanges on it:
//! - SSL negotiation, startup and authentication
//! - Simple and extended query protocols
//! - COPY in both directions
//! - Asynchronous notifications and cancel requests
//!
//! Every exchange reads up to the closing ReadyForQuery before returning,
//! even when the server reported an error, so a connection that returns a
//! non-fatal server error stays usable.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::buffer::WriteBuffer;
use super::protocol::*;
use super::reader::Reader;
use super::scram::{self, ScramClient};
use super::stream::{Socket, Stream};
use crate::error::{Error, PgError, Result};
use crate::options::{Options, SslMode};
use crate::row::{Discard, Model, QueryResult, Row, SharedColumns};
use crate::types::Append;
use crate::BoxFuture;

/// Size of the chunks read from a COPY source.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Notifications buffered while a listening connection runs other commands.
const MAX_PENDING_NOTIFICATIONS: usize = 100;

/// A message sent with NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Backend process that sent the notification.
    pub process_id: i32,
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
///
/// Connections are dialed uninitialized; [`Conn::init`] runs the startup
/// handshake.
pub struct Conn {
    id: u64,
    rd: Reader<Stream>,
    wb: WriteBuffer,
    /// Backend process ID
    process_id: i32,
    /// Backend secret key (for cancellation)
    secret_key: i32,
    inited: bool,
    created_at: Instant,
    last_used: Instant,
    stmt_counter: u64,
    /// Server parameters (e.g., server_version, client_encoding)
    params: HashMap<String, String>,
    tx_status: TransactionStatus,
    read_timeout: Duration,
    write_timeout: Duration,
    listening: bool,
    pending: VecDeque<Notification>,
}

impl Conn {
    pub fn new(id: u64, socket: Box<dyn Socket>) -> Self {
        let now = Instant::now();
        Self {
            id,
            rd: Reader::new(Stream::Plain(socket)),
            wb: WriteBuffer::new(),
            process_id: 0,
            secret_key: 0,
            inited: false,
            created_at: now,
            last_used: now,
            stmt_counter: 0,
            params: HashMap::new(),
            tx_status: TransactionStatus::Idle,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            listening: false,
            pending: VecDeque::new(),
        }
    }

    /// Unique id assigned by the pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Whether the startup handshake has completed.
    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn is_tls(&self) -> bool {
        self.rd.get_ref().is_tls()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// A server parameter reported through ParameterStatus, such as
    /// `server_version` or `TimeZone`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Sets the deadlines applied to each exchange. Zero disables one.
    pub fn set_timeouts(&mut self, read: Duration, write: Duration) {
        self.read_timeout = read;
        self.write_timeout = write;
    }

    /// Returns the next prepared statement name on this connection.
    pub fn next_id(&mut self) -> String {
        self.stmt_counter += 1;
        self.stmt_counter.to_string()
    }

    pub(crate) fn set_listening(&mut self, listening: bool) {
        self.listening = listening;
        if !listening {
            self.pending.clear();
        }
    }

    // ========================================================================
    // Reading and writing
    // ========================================================================

    /// Lends the write buffer to `f` and flushes it within `timeout`.
    ///
    /// Nothing is sent when `f` fails.
    pub async fn with_writer<F>(&mut self, timeout: Duration, f: F) -> Result<()>
    where
        F: FnOnce(&mut WriteBuffer) -> Result<()>,
    {
        self.wb.reset();
        if let Err(e) = f(&mut self.wb) {
            self.wb.reset();
            return Err(e);
        }
        if let Err(msg) = self.wb.check() {
            let err = Error::Format(msg.to_string());
            self.wb.reset();
            return Err(err);
        }
        deadline(timeout, "write timeout", self.wb.flush(self.rd.get_mut())).await?;
        self.touch();
        Ok(())
    }

    /// Writes an already framed buffer.
    pub async fn write_buffer(&mut self, timeout: Duration, buf: &WriteBuffer) -> Result<()> {
        buf.check().map_err(|msg| Error::Format(msg.to_string()))?;
        let stream = self.rd.get_mut();
        deadline(timeout, "write timeout", async {
            stream.write_all(buf.as_bytes()).await?;
            stream.flush().await
        })
        .await?;
        self.touch();
        Ok(())
    }

    /// Lends the reader to `f` with a read deadline of `timeout`.
    pub async fn with_reader<T, F>(&mut self, timeout: Duration, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Reader<Stream>) -> BoxFuture<'a, Result<T>>,
    {
        self.rd.set_timeout(timeout);
        let res = f(&mut self.rd).await;
        self.rd.clear_deadline();
        self.touch();
        res
    }

    async fn send<M: FrontendMessage>(&mut self, msg: M) -> Result<()> {
        let timeout = self.write_timeout;
        self.with_writer(timeout, |wb| {
            msg.encode(wb);
            Ok(())
        })
        .await
    }

    /// Receive a backend message.
    async fn recv(&mut self) -> Result<BackendMessage> {
        let (kind, body) = self.rd.read_message().await?;
        let msg = BackendMessage::decode(kind, body)?;
        trace!(conn = self.id, message = msg.name(), "received");
        Ok(msg)
    }

    /// Handles messages the server may send at any time.
    fn handle_async(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::ParameterStatus { name, value } => {
                debug!(conn = self.id, %name, %value, "parameter status");
                self.params.insert(name, value);
                Ok(())
            }
            BackendMessage::NoticeResponse { fields } => {
                let notice = PgError::new(fields);
                debug!(conn = self.id, %notice, "server notice");
                Ok(())
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                if !self.listening {
                    trace!(conn = self.id, %channel, "notification on a non-listening connection");
                    return Ok(());
                }
                if self.pending.len() >= MAX_PENDING_NOTIFICATIONS {
                    warn!(conn = self.id, %channel, "notification buffer is full, dropping oldest");
                    self.pending.pop_front();
                }
                self.pending.push_back(Notification {
                    channel,
                    payload,
                    process_id,
                });
                Ok(())
            }
            msg => Err(Error::Protocol(format!(
                "unexpected message {}",
                msg.name()
            ))),
        }
    }

    /// Reads until ReadyForQuery, discarding everything else.
    async fn read_until_ready(&mut self) -> Result<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.recv().await? {
                self.tx_status = status;
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Negotiates TLS, authenticates and runs the `on_connect` callback.
    pub async fn init(&mut self, opt: &Options) -> Result<()> {
        if let Some(config) = &opt.tls_config {
            if opt.ssl_mode != SslMode::Disable {
                self.enable_ssl(opt, config.clone()).await?;
            }
        }

        self.rd.set_timeout(self.read_timeout);
        let res = self.startup(opt).await;
        self.rd.clear_deadline();
        res?;
        self.inited = true;

        if let Some(on_connect) = &opt.on_connect {
            on_connect(self).await?;
        }
        Ok(())
    }

    async fn enable_ssl(&mut self, opt: &Options, config: Arc<rustls::ClientConfig>) -> Result<()> {
        self.send(SslRequestMessage).await?;

        self.rd.set_timeout(self.read_timeout);
        let answer = self.rd.read_byte().await;
        self.rd.clear_deadline();

        match answer? {
            b'S' => {
                // Bytes received before the handshake would bypass TLS
                if self.rd.buffered() > 0 {
                    return Err(Error::Protocol(
                        "unencrypted data after SSL response".to_string(),
                    ));
                }
                let host = opt.host();
                let upgrade = self.rd.get_mut().upgrade(config, host);
                match self.read_timeout {
                    d if d.is_zero() => upgrade.await?,
                    d => tokio::time::timeout(d, upgrade)
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))??,
                }
                debug!(conn = self.id, host, "TLS enabled");
                Ok(())
            }
            b'N' if opt.ssl_mode == SslMode::Require => Err(Error::SslNotSupported),
            b'N' => {
                debug!(conn = self.id, "server refused TLS, continuing without it");
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSL response {:?}",
                other as char
            ))),
        }
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self, opt: &Options) -> Result<()> {
        let mut params: Vec<(&str, &str)> = Vec::with_capacity(opt.params.len() + 1);
        if !opt.application_name.is_empty() {
            params.push(("application_name", opt.application_name.as_str()));
        }
        params.extend(opt.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        self.send(StartupMessage {
            user: &opt.user,
            database: &opt.database,
            params,
        })
        .await?;

        loop {
            match self.recv().await? {
                BackendMessage::AuthenticationOk => {
                    debug!(conn = self.id, user = %opt.user, "authenticated");
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    debug!(conn = self.id, method = "cleartext", "authenticating");
                    let password = required_password(opt)?;
                    self.send(PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    debug!(conn = self.id, method = "md5", "authenticating");
                    let hash = md5_password(&opt.user, required_password(opt)?, &salt);
                    self.send(PasswordMessage { password: &hash }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    debug!(conn = self.id, method = scram::MECHANISM, "authenticating");
                    self.auth_scram(opt, &mechanisms).await?;
                }
                BackendMessage::AuthenticationUnsupported { code } => {
                    return Err(Error::Auth(format!(
                        "unsupported authentication method {}",
                        code
                    )));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::new(fields).into());
                }
                msg => self.handle_async(msg)?,
            }
        }
    }

    async fn auth_scram(&mut self, opt: &Options, mechanisms: &[String]) -> Result<()> {
        if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
            return Err(Error::Auth(format!(
                "server requires unsupported SASL mechanisms: {:?}",
                mechanisms
            )));
        }

        let mut client = ScramClient::new(&opt.user, required_password(opt)?);
        let first = client.client_first_message();
        self.send(SaslInitialResponseMessage {
            mechanism: scram::MECHANISM,
            data: &first,
        })
        .await?;

        let data = match self.recv().await? {
            BackendMessage::AuthenticationSASLContinue { data } => data,
            BackendMessage::ErrorResponse { fields } => return Err(PgError::new(fields).into()),
            msg => return Err(unexpected_during_sasl(&msg)),
        };
        let client_final = client
            .process_server_first(&data)
            .map_err(|e| Error::Auth(e.to_string()))?;
        self.send(SaslResponseMessage { data: &client_final }).await?;

        match self.recv().await? {
            BackendMessage::AuthenticationSASLFinal { data } => client
                .verify_server_final(&data)
                .map_err(|e| Error::Auth(e.to_string())),
            BackendMessage::ErrorResponse { fields } => Err(PgError::new(fields).into()),
            msg => Err(unexpected_during_sasl(&msg)),
        }
    }

    // ========================================================================
    // Simple query protocol
    // ========================================================================

    /// Runs `query` with the simple query protocol, feeding rows to `model`.
    ///
    /// With several statements in `query` the result of the last one is
    /// returned.
    pub async fn simple_query(&mut self, query: &[u8], model: &mut dyn Model) -> Result<QueryResult> {
        self.send(QueryMessage { query }).await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_simple_query(model).await;
        self.rd.clear_deadline();
        res
    }

    async fn read_simple_query(&mut self, model: &mut dyn Model) -> Result<QueryResult> {
        let mut columns: SharedColumns = Arc::from(Vec::new());
        let mut rows = 0;
        let mut result = None;
        let mut first_err = None;

        loop {
            match self.recv().await? {
                BackendMessage::RowDescription { columns: cols } => {
                    columns = cols.into();
                    rows = 0;
                }
                BackendMessage::DataRow { values } => {
                    rows += 1;
                    if first_err.is_none() {
                        if let Err(e) = model.add_row(Row::new(columns.clone(), values)) {
                            first_err = Some(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    result = Some(QueryResult::new(tag, rows));
                    rows = 0;
                }
                BackendMessage::EmptyQueryResponse => result = Some(QueryResult::empty()),
                BackendMessage::CopyInResponse => {
                    // COPY FROM STDIN needs a data source; abort it
                    self.send(CopyFailMessage {
                        message: "COPY FROM STDIN requires copy_from",
                    })
                    .await?;
                }
                BackendMessage::CopyOutResponse
                | BackendMessage::CopyData { .. }
                | BackendMessage::CopyDone => {}
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    break;
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::new(fields);
                    if err.is_fatal() {
                        return Err(err.into());
                    }
                    first_err.get_or_insert(err.into());
                }
                msg => self.handle_async(msg)?,
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or_else(QueryResult::empty)),
        }
    }

    // ========================================================================
    // Extended query protocol
    // ========================================================================

    /// Parses `query` as the prepared statement `name` and returns its
    /// result columns (empty for statements that return no rows).
    pub async fn prepare(&mut self, name: &str, query: &str) -> Result<SharedColumns> {
        let timeout = self.write_timeout;
        self.with_writer(timeout, |wb| {
            ParseMessage { name, query }.encode(wb);
            DescribeMessage { kind: b'S', name }.encode(wb);
            SyncMessage.encode(wb);
            Ok(())
        })
        .await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_prepare().await;
        self.rd.clear_deadline();
        res
    }

    async fn read_prepare(&mut self) -> Result<SharedColumns> {
        let mut columns: SharedColumns = Arc::from(Vec::new());
        let mut first_err = None;

        loop {
            match self.recv().await? {
                BackendMessage::ParseComplete
                | BackendMessage::ParameterDescription { .. }
                | BackendMessage::NoData => {}
                BackendMessage::RowDescription { columns: cols } => columns = cols.into(),
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    break;
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::new(fields);
                    if err.is_fatal() {
                        return Err(err.into());
                    }
                    first_err.get_or_insert(err);
                }
                msg => self.handle_async(msg)?,
            }
        }

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(columns),
        }
    }

    /// Binds `params` to the prepared statement `name` and executes it.
    /// All parameters are sent in text format.
    pub async fn exec_prepared(
        &mut self,
        name: &str,
        columns: &SharedColumns,
        params: &[&dyn Append],
        model: &mut dyn Model,
    ) -> Result<QueryResult> {
        let timeout = self.write_timeout;
        self.with_writer(timeout, |wb| {
            BindMessage {
                portal: "",
                statement: name,
                params,
            }
            .encode(wb);
            ExecuteMessage {
                portal: "",
                max_rows: 0,
            }
            .encode(wb);
            SyncMessage.encode(wb);
            Ok(())
        })
        .await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_exec(columns, model).await;
        self.rd.clear_deadline();
        res
    }

    async fn read_exec(&mut self, columns: &SharedColumns, model: &mut dyn Model) -> Result<QueryResult> {
        let mut rows = 0;
        let mut result = None;
        let mut first_err = None;

        loop {
            match self.recv().await? {
                BackendMessage::BindComplete | BackendMessage::PortalSuspended => {}
                BackendMessage::DataRow { values } => {
                    rows += 1;
                    if first_err.is_none() {
                        if let Err(e) = model.add_row(Row::new(columns.clone(), values)) {
                            first_err = Some(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => result = Some(QueryResult::new(tag, rows)),
                BackendMessage::EmptyQueryResponse => result = Some(QueryResult::empty()),
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    break;
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::new(fields);
                    if err.is_fatal() {
                        return Err(err.into());
                    }
                    first_err.get_or_insert(err.into());
                }
                msg => self.handle_async(msg)?,
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or_else(QueryResult::empty)),
        }
    }

    /// Deallocates the prepared statement `name`.
    pub async fn close_statement(&mut self, name: &str) -> Result<()> {
        let timeout = self.write_timeout;
        self.with_writer(timeout, |wb| {
            CloseMessage { kind: b'S', name }.encode(wb);
            FlushMessage.encode(wb);
            Ok(())
        })
        .await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_close().await;
        self.rd.clear_deadline();
        res
    }

    /// Flush yields no ReadyForQuery; after an error the session is
    /// resynchronized with Sync.
    async fn read_close(&mut self) -> Result<()> {
        loop {
            match self.recv().await? {
                BackendMessage::CloseComplete => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::new(fields);
                    self.send(SyncMessage).await?;
                    self.read_until_ready().await?;
                    return Err(err.into());
                }
                msg => self.handle_async(msg)?,
            }
        }
    }

    // ========================================================================
    // COPY
    // ========================================================================

    /// Runs a `COPY ... FROM STDIN` query, streaming `source` to the server.
    ///
    /// When `source` fails the COPY is aborted with CopyFail and the source
    /// error is returned; the connection stays usable.
    pub async fn copy_in<R>(&mut self, query: &[u8], source: &mut R) -> Result<QueryResult>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.send(QueryMessage { query }).await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_copy_in_response().await;
        self.rd.clear_deadline();
        res?;

        let timeout = self.write_timeout;
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            let n = match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(conn = self.id, error = %e, "COPY source failed, aborting");
                    let message = e.to_string();
                    self.send(CopyFailMessage { message: &message }).await?;
                    self.rd.set_timeout(self.read_timeout);
                    let drained = self.read_until_ready().await;
                    self.rd.clear_deadline();
                    drained?;
                    return Err(e.into());
                }
            };
            let data = &chunk[..n];
            self.with_writer(timeout, |wb| {
                CopyDataMessage { data }.encode(wb);
                Ok(())
            })
            .await?;
        }

        self.send(CopyDoneMessage).await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_simple_query(&mut Discard).await;
        self.rd.clear_deadline();
        res
    }

    async fn read_copy_in_response(&mut self) -> Result<()> {
        loop {
            match self.recv().await? {
                BackendMessage::CopyInResponse => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::new(fields);
                    if !err.is_fatal() {
                        self.read_until_ready().await?;
                    }
                    return Err(err.into());
                }
                msg => self.handle_async(msg)?,
            }
        }
    }

    /// Runs a `COPY ... TO STDOUT` query, streaming the data to `sink`.
    pub async fn copy_out<W>(&mut self, query: &[u8], sink: &mut W) -> Result<QueryResult>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.send(QueryMessage { query }).await?;

        self.rd.set_timeout(self.read_timeout);
        let res = self.read_copy_out(sink).await;
        self.rd.clear_deadline();
        res
    }

    async fn read_copy_out<W>(&mut self, sink: &mut W) -> Result<QueryResult>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut result = None;
        let mut first_err: Option<Error> = None;

        loop {
            match self.recv().await? {
                BackendMessage::CopyOutResponse | BackendMessage::CopyDone => {}
                BackendMessage::CopyData { data } => {
                    if first_err.is_none() {
                        if let Err(e) = sink.write_all(&data).await {
                            first_err = Some(e.into());
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => result = Some(QueryResult::new(tag, 0)),
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    break;
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = PgError::new(fields);
                    if err.is_fatal() {
                        return Err(err.into());
                    }
                    first_err.get_or_insert(err.into());
                }
                msg => self.handle_async(msg)?,
            }
        }

        if first_err.is_none() {
            if let Err(e) = sink.flush().await {
                first_err = Some(e.into());
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or_else(QueryResult::empty)),
        }
    }

    // ========================================================================
    // Notifications and cancellation
    // ========================================================================

    /// Waits up to `timeout` for a notification. A zero timeout waits
    /// forever.
    pub async fn receive_notification(&mut self, timeout: Duration) -> Result<Notification> {
        if let Some(n) = self.pending.pop_front() {
            return Ok(n);
        }

        self.rd.set_timeout(timeout);
        let res = self.read_notification().await;
        self.rd.clear_deadline();
        res
    }

    async fn read_notification(&mut self) -> Result<Notification> {
        loop {
            match self.recv().await? {
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    return Ok(Notification {
                        channel,
                        payload,
                        process_id,
                    })
                }
                BackendMessage::ReadyForQuery { status } => self.tx_status = status,
                BackendMessage::ErrorResponse { fields } => return Err(PgError::new(fields).into()),
                msg => self.handle_async(msg)?,
            }
        }
    }

    /// Sends a CancelRequest for the backend `process_id`. Used on a fresh,
    /// uninitialized connection; the server closes it without replying.
    pub async fn write_cancel_request(&mut self, process_id: i32, secret_key: i32) -> Result<()> {
        self.send(CancelRequestMessage {
            process_id,
            secret_key,
        })
        .await
    }

    /// Sends Terminate (when the session was started) and shuts the socket
    /// down.
    pub async fn close(&mut self) -> Result<()> {
        if self.inited {
            self.inited = false;
            let timeout = match self.write_timeout {
                d if d.is_zero() => Duration::from_secs(1),
                d => d,
            };
            let _ = self
                .with_writer(timeout, |wb| {
                    TerminateMessage.encode(wb);
                    Ok(())
                })
                .await;
        }
        self.rd.get_mut().shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("inited", &self.inited)
            .field("tls", &self.is_tls())
            .field("tx_status", &self.tx_status)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn deadline<T, F>(timeout: Duration, what: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, what))?
}

fn required_password(opt: &Options) -> Result<&str> {
    if opt.password.is_empty() {
        return Err(Error::Auth("password is required".to_string()));
    }
    Ok(&opt.password)
}

fn unexpected_during_sasl(msg: &BackendMessage) -> Error {
    Error::Protocol(format!("unexpected {} during SASL exchange", msg.name()))
}

/// Compute MD5 password hash for PostgreSQL authentication.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hex = format!("{:x}", md5::compute(inner.as_bytes()));

    let mut outer = inner_hex.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

