//! Transport under a connection: plain sockets, TLS, and the dialer that
//! opens them.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Default Unix socket path used when the address is empty.
pub const DEFAULT_UNIX_SOCKET: &str = "/var/run/postgresql/.s.PGSQL.5432";

/// A bidirectional byte stream a connection can run on.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Socket for T {}

// ============================================================================
// Dialer
// ============================================================================

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Box<dyn Socket>>> + Send + 'a>>;

/// Opens sockets to the server. Replace it to tunnel connections or to
/// test without a server.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> DialFuture<'a>;
}

/// Dials `tcp` addresses with TCP_NODELAY and `unix` socket paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDialer;

impl Dialer for DefaultDialer {
    fn dial<'a>(&'a self, network: &'a str, addr: &'a str) -> DialFuture<'a> {
        Box::pin(dial_default(network, addr))
    }
}

async fn dial_default(network: &str, addr: &str) -> io::Result<Box<dyn Socket>> {
    match network {
        "tcp" => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let path = if addr.is_empty() { DEFAULT_UNIX_SOCKET } else { addr };
            Ok(Box::new(tokio::net::UnixStream::connect(path).await?))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported network {:?}", network),
        )),
    }
}

// ============================================================================
// Stream
// ============================================================================

/// The socket of a connection, before or after the TLS upgrade.
pub enum Stream {
    Plain(Box<dyn Socket>),
    Tls(Box<TlsStream<Box<dyn Socket>>>),
    /// Placeholder while the socket is moved into a TLS session.
    Detached,
}

impl Stream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// Wraps the plain socket in a TLS session.
    pub(crate) async fn upgrade(&mut self, config: Arc<ClientConfig>, host: &str) -> Result<()> {
        let Stream::Plain(socket) = std::mem::replace(self, Stream::Detached) else {
            return Err(Error::Protocol("TLS upgrade of a non-plain stream".to_string()));
        };
        let name = server_name(host)?;
        let tls = TlsConnector::from(config).connect(name, socket).await?;
        *self = Stream::Tls(Box::new(tls));
        Ok(())
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Detached => Poll::Ready(Err(detached())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
            Stream::Detached => Poll::Ready(Err(detached())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Detached => Poll::Ready(Ok(())),
        }
    }
}

// ============================================================================
// TLS
// ============================================================================

fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Config(format!("invalid server name {:?}: {}", host, e)))
}

/// A client config that encrypts without checking the server certificate,
/// matching libpq's `sslmode=require`.
pub fn insecure_tls_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
