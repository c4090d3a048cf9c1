//! Configuration surfaces for `listen` (server) and `connect` (client).
//!
//! Grounded on `hat.juggler.server.listen`'s keyword arguments and the
//! teacher's `ServerConfigBuilder` (`turbomcp-server::config`), which favors
//! a builder over a struct-literal-with-`..Default::default()` so optional
//! knobs read as a fluent chain at the call site.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;

use crate::session::RequestMode;
use crate::storage::Storage;
use crate::transport::{DEFAULT_PING_DELAY, DEFAULT_PING_TIMEOUT, DEFAULT_SEND_QUEUE_SIZE};

// TLS termination is an explicit non-goal of the core protocol (see this
// crate's top-level docs): `ServerConfig` expects TLS to be handled by a
// front-end proxy or a wrapper around `axum::serve`, and `ClientConfig`
// accepts a `tokio_tungstenite::Connector` (already available transitively
// through the `native-tls` feature) for the one case a `wss://` dial needs
// to customize — no new TLS dependency is pulled in for this.

/// Default autoflush coalescing window for server-side state sync.
pub const DEFAULT_AUTOFLUSH_DELAY: Duration = Duration::from_millis(200);
/// Default grace period for a connection's close to drain its task scope.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);
/// Default WebSocket upgrade path.
pub const DEFAULT_WS_PATH: &str = "/ws";
/// Default root-redirect target when a `static_dir` is configured.
pub const DEFAULT_INDEX_PATH: &str = "/index.html";

/// Server-side `listen` configuration.
pub struct ServerConfig {
    pub(crate) host: IpAddr,
    pub(crate) port: u16,
    pub(crate) ws_path: String,
    pub(crate) static_dir: Option<PathBuf>,
    pub(crate) index_path: Option<String>,
    pub(crate) htpasswd_file: Option<PathBuf>,
    pub(crate) autoflush_delay: Option<Duration>,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) state: Option<Storage>,
    pub(crate) parallel_requests: bool,
    pub(crate) additional_routes: Option<Router>,
    pub(crate) send_queue_size: usize,
    pub(crate) max_segment_size: usize,
    pub(crate) ping_delay: Duration,
    pub(crate) ping_timeout: Duration,
    pub(crate) no_cache: bool,
}

impl ServerConfig {
    /// Start a builder bound to `host:port`; every other option defaults per
    /// the table in this crate's configuration surface documentation.
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            ws_path: DEFAULT_WS_PATH.to_string(),
            static_dir: None,
            index_path: Some(DEFAULT_INDEX_PATH.to_string()),
            htpasswd_file: None,
            autoflush_delay: Some(DEFAULT_AUTOFLUSH_DELAY),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: None,
            parallel_requests: false,
            additional_routes: None,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            max_segment_size: crate::frame::DEFAULT_MAX_SEGMENT_SIZE,
            ping_delay: DEFAULT_PING_DELAY,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            no_cache: true,
        }
    }

    /// WebSocket upgrade path (default `/ws`).
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Serve static files under `/` from `dir`.
    pub fn static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    /// Root-redirect target (default `/index.html`). Pass `None` to disable
    /// the `/` -> index redirect entirely.
    pub fn index_path(mut self, path: Option<String>) -> Self {
        self.index_path = path;
        self
    }

    /// Require HTTP Basic auth against an htpasswd file.
    pub fn htpasswd_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.htpasswd_file = Some(path.into());
        self
    }

    /// Set the `autoflush_delay` policy; see the state-sync engine docs.
    /// `None` disables automatic sync (manual `flush()` only).
    pub fn autoflush_delay(mut self, delay: Option<Duration>) -> Self {
        self.autoflush_delay = delay;
        self
    }

    /// Grace period for a connection's close to drain (default 100ms).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Share one `Storage` across every connection instead of giving each a
    /// fresh, per-connection document.
    pub fn state(mut self, state: Storage) -> Self {
        self.state = Some(state);
        self
    }

    /// Dispatch inbound requests onto the connection's task scope instead of
    /// processing them one at a time (default `false`).
    pub fn parallel_requests(mut self, parallel: bool) -> Self {
        self.parallel_requests = parallel;
        self
    }

    /// Request dispatch mode implied by `parallel_requests`.
    pub fn request_mode(&self) -> RequestMode {
        if self.parallel_requests {
            RequestMode::Parallel
        } else {
            RequestMode::Serialized
        }
    }

    /// Merge additional user-defined HTTP routes into the server's router.
    pub fn additional_routes(mut self, routes: Router) -> Self {
        self.additional_routes = Some(routes);
        self
    }

    /// Outbound queue depth per connection (default 1024).
    pub fn send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Maximum bytes of JSON payload per outbound segment (default 65536).
    pub fn max_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Heartbeat idle delay before a ping is sent (default 30s).
    pub fn ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    /// Heartbeat idle timeout after a ping before the connection fails
    /// (default 30s).
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Whether every HTTP response carries `Cache-Control: no-cache`
    /// (default `true`).
    pub fn no_cache(mut self, enabled: bool) -> Self {
        self.no_cache = enabled;
        self
    }
}

/// Client-side `connect` configuration.
pub struct ClientConfig {
    pub(crate) address: String,
    pub(crate) auth: Option<(String, String)>,
    pub(crate) connector: Option<tokio_tungstenite::Connector>,
    pub(crate) send_queue_size: usize,
    pub(crate) max_segment_size: usize,
    pub(crate) ping_delay: Duration,
    pub(crate) ping_timeout: Duration,
}

impl ClientConfig {
    /// Start a builder that dials `address` (a `ws://` or `wss://` URL).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth: None,
            connector: None,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            max_segment_size: crate::frame::DEFAULT_MAX_SEGMENT_SIZE,
            ping_delay: DEFAULT_PING_DELAY,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    /// Send an `Authorization: Basic` header with every HTTP request made
    /// during the dial (the initial upgrade request).
    pub fn auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }

    /// Use a custom TLS connector for `wss://` addresses (native-tls or
    /// rustls, per [`tokio_tungstenite::Connector`]).
    pub fn connector(mut self, connector: tokio_tungstenite::Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Outbound queue depth (default 1024).
    pub fn send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Maximum bytes of JSON payload per outbound segment (default 65536).
    pub fn max_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Heartbeat idle delay before a ping is sent (default 30s).
    pub fn ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    /// Heartbeat idle timeout after a ping before the connection fails
    /// (default 30s).
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }
}
