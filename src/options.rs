//! Connection and pool configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use url::Url;

use crate::error::{Error, Result};
use crate::pg::connection::Conn;
use crate::pg::stream::{insecure_tls_config, DefaultDialer, Dialer};
use crate::BoxFuture;

/// Callback run on every new connection after startup, e.g. to `SET` session
/// variables.
pub type OnConnect = Arc<dyn for<'a> Fn(&'a mut Conn) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Callback run when the pool retires a connection.
pub type OnClose = Arc<dyn Fn(&Conn) + Send + Sync>;

/// When to negotiate TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never send SSLRequest.
    #[default]
    Disable,
    /// Try TLS, continue in plaintext if the server refuses.
    Allow,
    /// Same as `Allow`.
    Prefer,
    /// Fail with [`Error::SslNotSupported`] if the server refuses TLS.
    Require,
}

/// Database connection options.
///
/// [`Options::default`] reads `PGHOST`, `PGPORT`, `PGUSER`, `PGDATABASE` and
/// `PGPASSWORD` from the environment. Zero durations disable the
/// corresponding timeout.
#[derive(Clone)]
pub struct Options {
    /// `tcp` or `unix`.
    pub network: String,
    /// `host:port`, or a socket path for `unix`.
    pub addr: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub application_name: String,

    pub tls_config: Option<Arc<ClientConfig>>,
    pub ssl_mode: SslMode,

    /// Opens the sockets; see [`Dialer`].
    pub dialer: Arc<dyn Dialer>,
    pub on_connect: Option<OnConnect>,
    pub on_close: Option<OnClose>,

    /// Run-time parameters sent in the StartupMessage.
    pub params: Vec<(String, String)>,

    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    /// Retries for failed queries; 0 disables retrying.
    pub max_retries: u32,
    /// Also retry queries cancelled by `statement_timeout`.
    pub retry_statement_timeout: bool,
    pub min_retry_backoff: Duration,
    pub max_retry_backoff: Duration,

    pub pool_size: usize,
    /// Time to wait for a free connection. Zero derives it from the read
    /// timeout.
    pub pool_timeout: Duration,
    /// Idle connections older than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// Connections older than this are closed when returned or reaped.
    pub max_conn_age: Duration,
    pub idle_check_frequency: Duration,
}

impl Default for Options {
    fn default() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let host = env("PGHOST").unwrap_or_else(|| "localhost".to_string());
        let port = env("PGPORT").unwrap_or_else(|| "5432".to_string());
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());

        Self {
            network: "tcp".to_string(),
            addr: format!("{}:{}", host, port),
            user: env("PGUSER").unwrap_or_else(|| "postgres".to_string()),
            password: env("PGPASSWORD").unwrap_or_default(),
            database: env("PGDATABASE").unwrap_or_else(|| "postgres".to_string()),
            application_name: String::new(),
            tls_config: None,
            ssl_mode: SslMode::Disable,
            dialer: Arc::new(DefaultDialer),
            on_connect: None,
            on_close: None,
            params: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            max_retries: 0,
            retry_statement_timeout: false,
            min_retry_backoff: Duration::from_millis(250),
            max_retry_backoff: Duration::from_secs(4),
            pool_size: 10 * parallelism,
            pool_timeout: Duration::ZERO,
            idle_timeout: Duration::from_secs(5 * 60),
            max_conn_age: Duration::ZERO,
            idle_check_frequency: Duration::from_secs(60),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `postgres://[user[:password]@]host[:port]/database[?params]`.
    ///
    /// Recognised parameters: `sslmode` (`disable`, `allow`, `prefer`),
    /// `application_name` and `connect_timeout` in seconds.
    pub fn parse_url(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| Error::Config(format!("invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(Error::Config(format!("invalid scheme: {}", url.scheme())));
        }

        let mut opt = Options::default();

        let host = url.host_str().unwrap_or("localhost");
        let port = url.port().unwrap_or(5432);
        opt.addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        if !url.username().is_empty() {
            opt.user = decode(url.username())?;
        }
        if let Some(password) = url.password() {
            opt.password = decode(password)?;
        }

        let database = url.path().trim_start_matches('/');
        if database.is_empty() {
            return Err(Error::Config("database name is required".to_string()));
        }
        opt.database = decode(database)?;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => match value.as_ref() {
                    "disable" => {
                        opt.ssl_mode = SslMode::Disable;
                        opt.tls_config = None;
                    }
                    "allow" | "prefer" => {
                        opt.ssl_mode = if value == "allow" {
                            SslMode::Allow
                        } else {
                            SslMode::Prefer
                        };
                        opt.tls_config = Some(insecure_tls_config()?);
                    }
                    "require" | "verify-ca" | "verify-full" => {
                        return Err(Error::Config(format!(
                            "sslmode '{}' is not supported; set Options::tls_config instead",
                            value
                        )))
                    }
                    other => return Err(Error::Config(format!("invalid sslmode '{}'", other))),
                },
                "application_name" => opt.application_name = value.into_owned(),
                "connect_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::Config(format!("invalid connect_timeout '{}'", value))
                    })?;
                    opt.dial_timeout = Duration::from_secs(secs);
                }
                other => {
                    return Err(Error::Config(format!("unsupported option '{}'", other)))
                }
            }
        }

        Ok(opt)
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Connects through a Unix socket; an empty path selects the default.
    pub fn unix_socket(mut self, path: impl Into<String>) -> Self {
        self.network = "unix".to_string();
        self.addr = path.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Uses TLS and refuses servers that don't support it.
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self.ssl_mode = SslMode::Require;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Conn) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Adds a run-time parameter to the StartupMessage.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn retry_statement_timeout(mut self, retry: bool) -> Self {
        self.retry_statement_timeout = retry;
        self
    }

    pub fn retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_backoff = min;
        self.max_retry_backoff = max;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_conn_age(mut self, age: Duration) -> Self {
        self.max_conn_age = age;
        self
    }

    pub fn idle_check_frequency(mut self, every: Duration) -> Self {
        self.idle_check_frequency = every;
        self
    }

    // ========================================================================
    // Derived values
    // ========================================================================

    /// Host part of `addr`, used as the TLS server name.
    pub fn host(&self) -> &str {
        let addr = self.addr.as_str();
        if let Some(rest) = addr.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        addr.rsplit_once(':').map_or(addr, |(host, _)| host)
    }

    /// Pool timeout with the zero value resolved.
    pub fn effective_pool_timeout(&self) -> Duration {
        match self.pool_timeout {
            d if !d.is_zero() => d,
            _ if !self.read_timeout.is_zero() => self.read_timeout + Duration::from_secs(1),
            _ => Duration::from_secs(30),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be positive".to_string()));
        }
        if self.ssl_mode == SslMode::Require && self.tls_config.is_none() {
            return Err(Error::Config("sslmode require needs a tls_config".to_string()));
        }
        if self.min_retry_backoff > self.max_retry_backoff {
            return Err(Error::Config(
                "min_retry_backoff exceeds max_retry_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

fn decode(s: &str) -> Result<String> {
    url::form_urlencoded::parse(format!("x={}", s.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| Error::Config(format!("invalid URL component {:?}", s)))
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("network", &self.network)
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("tls", &self.tls_config.is_some())
            .field("ssl_mode", &self.ssl_mode)
            .field("pool_size", &self.pool_size)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
