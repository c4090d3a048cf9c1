//! `listen`: accept side. Assembles an `axum::Router` (optional basic-auth,
//! the WebSocket upgrade route, optional static files) and spawns a
//! [`Connection`] per accepted socket.
//!
//! Grounded on `hat.juggler.server.listen` for route assembly order (redirect
//! route, then the WS route, then static files last) and on the teacher's
//! `axum` WebSocket handler (`turbomcp-transport::axum::handlers::websocket`)
//! for the upgrade-then-split-then-spawn shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::HtpasswdAuth;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionConfig, ConnectionHandler};
use crate::error::{JugglerError, JugglerResult};
use crate::session::{NotifyHandler, RequestHandler};
use crate::transport::{TransportConfig, WsEvent, WsSink, WsStream};

/// A running server: the bound address and a handle that, when dropped or
/// explicitly [`Server::close`]d, stops accepting new connections.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: tokio::sync::watch::Sender<bool>,
    accept_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    connections: Arc<std::sync::Mutex<HashMap<u64, Connection>>>,
}

impl Server {
    /// The bound local address (useful when `port` was `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections and close every currently live one.
    ///
    /// Mirrors `hat.juggler.server.listen`'s close behavior: closing the
    /// server closes every connection it accepted, not just the accept loop.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);

        let live: Vec<Connection> = self.connections.lock().unwrap().values().cloned().collect();
        for conn in live {
            conn.close().await;
        }

        if let Some(handle) = self.accept_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    connection_handler: Option<ConnectionHandler>,
    request_handler: Option<RequestHandler>,
    notify_handler: Option<NotifyHandler>,
    connections: Arc<std::sync::Mutex<HashMap<u64, Connection>>>,
    next_connection_id: Arc<std::sync::atomic::AtomicU64>,
}

/// Bind and start serving `config.host:config.port`, accepting connections
/// until the returned [`Server`] is closed.
///
/// `connection_handler`, if given, is invoked once per accepted connection
/// with its [`Connection`] handle — the caller's way to reach `notify`,
/// `storage()`, or `flush()` from the server side.  `request_handler`
/// answers inbound requests (`None` fails every non-empty request name);
/// `notify_handler` receives inbound notifications from clients, if any
/// arrive (the protocol does not require clients to send them).
pub async fn listen(
    config: ServerConfig,
    connection_handler: Option<ConnectionHandler>,
    request_handler: Option<RequestHandler>,
    notify_handler: Option<NotifyHandler>,
) -> JugglerResult<Server> {
    let auth = match &config.htpasswd_file {
        Some(path) => Some(Arc::new(HtpasswdAuth::load(path)?)),
        None => None,
    };

    let host = config.host;
    let port = config.port;
    let addr = SocketAddr::from((host, port));

    let connections = Arc::new(std::sync::Mutex::new(HashMap::new()));

    let state = AppState {
        config: Arc::new(config),
        connection_handler,
        request_handler,
        notify_handler,
        connections: connections.clone(),
        next_connection_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
    };

    let mut router = Router::new();

    if let Some(index_path) = &state.config.index_path {
        let index_path = index_path.clone();
        router = router.route(
            "/",
            get(move || {
                let target = index_path.clone();
                async move { Redirect::temporary(&target) }
            }),
        );
    }

    router = router.route(&state.config.ws_path, get(ws_upgrade_handler));

    // Static files are a fallback, not a route at "/": the redirect and the
    // WS upgrade above already own their exact paths, and everything else
    // (including "/" itself when no redirect is configured) falls through to
    // `ServeDir`, mirroring the original's route-registration-order
    // semantics without an exact-vs-prefix route conflict.
    if let Some(dir) = &state.config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    let no_cache = state.config.no_cache;
    let additional_routes = state.config.additional_routes.clone();
    let mut router = router.with_state(state);

    // Merged after `with_state` so a caller's `Router` (necessarily
    // stateless, since it was built before this server existed) doesn't have
    // to unify its state type with ours.
    if let Some(extra) = additional_routes {
        router = router.merge(extra);
    }

    router = router.layer(TraceLayer::new_for_http());
    if no_cache {
        router = router.layer(axum::middleware::from_fn(no_cache_layer));
    }

    // Applied router-wide, outermost, so it covers every route — the root
    // redirect and the static-file fallback included, not just the WS
    // upgrade — per "every HTTP request requires Authorization: Basic".
    router = router.layer(axum::middleware::from_fn(move |req, next| {
        let auth = auth.clone();
        async move { auth_layer(auth, req, next).await }
    }));

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("juggler server listening on {local_addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let accept_task = tokio::spawn(async move {
        let result = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(wait_for_true(shutdown_rx))
            .await;
        if let Err(e) = result {
            error!("server accept loop error: {e}");
        }
        info!("juggler server stopped accepting connections");
    });

    Ok(Server {
        local_addr,
        shutdown: shutdown_tx,
        accept_task: AsyncMutex::new(Some(accept_task)),
        connections,
    })
}

async fn wait_for_true(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn no_cache_layer(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let mut res = next.run(req).await;
    res.headers_mut()
        .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    res
}

async fn ws_upgrade_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Applied router-wide: every request, not just the WS upgrade, is checked
/// against the configured htpasswd file when one is set.
async fn auth_layer(
    auth: Option<Arc<HtpasswdAuth>>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(auth) = auth else {
        return next.run(req).await;
    };
    match check_basic_auth(req.headers(), &auth) {
        Ok(()) => next.run(req).await,
        Err(resp) => resp,
    }
}

fn check_basic_auth(headers: &axum::http::HeaderMap, auth: &HtpasswdAuth) -> Result<(), Response> {
    use base64::Engine;

    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"juggler\"")],
        )
            .into_response()
    };

    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(unauthorized());
    };
    let Ok(value) = value.to_str() else {
        return Err(unauthorized());
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Err(unauthorized());
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return Err(unauthorized());
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return Err(unauthorized());
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return Err(unauthorized());
    };

    if auth.verify(user, password) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let config = &state.config;

    let local_state = Some((
        config.state.clone().unwrap_or_default(),
        config.autoflush_delay,
    ));

    let connection = Connection::spawn(ConnectionConfig {
        sink: Box::new(AxumSink(sink)),
        stream: Box::new(AxumStream(stream)),
        transport_config: TransportConfig {
            max_segment_size: config.max_segment_size,
            send_queue_size: config.send_queue_size,
            ping_delay: config.ping_delay,
            ping_timeout: config.ping_timeout,
        },
        shutdown_timeout: config.shutdown_timeout,
        local_state,
        request_handler: state.request_handler.clone(),
        request_mode: config.request_mode(),
        notify_handler: state.notify_handler.clone(),
    });

    let conn_id = state
        .next_connection_id
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    state
        .connections
        .lock()
        .unwrap()
        .insert(conn_id, connection.clone());

    // A panicking `connection_handler` closes the connection rather than
    // unwinding this task and leaving it half-alive: "exceptions in the
    // callback close the client connection", not crash the server.
    if let Some(handler) = &state.connection_handler {
        let handler = handler.clone();
        let conn_for_handler = connection.clone();
        let panicked =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || handler(conn_for_handler))).is_err();
        if panicked {
            warn!("connection handler panicked; closing connection");
            connection.close().await;
            state.connections.lock().unwrap().remove(&conn_id);
            return;
        }
    }

    // Mirrors `Server._ws_handler` awaiting `conn.wait_closed()`: the socket
    // task stays alive (keeping the connection's task scope from being
    // dropped mid-flight) until the transport or session signals shutdown
    // (including a shutdown triggered by `Server::close` closing this
    // connection directly), then drains the scope.
    connection.wait_closed().await;
    connection.close().await;
    state.connections.lock().unwrap().remove(&conn_id);
}

struct AxumSink(futures::stream::SplitSink<WebSocket, Message>);

#[async_trait]
impl WsSink for AxumSink {
    async fn send_text(&mut self, text: String) -> JugglerResult<()> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| JugglerError::Disconnected)
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

struct AxumStream(futures::stream::SplitStream<WebSocket>);

#[async_trait]
impl WsStream for AxumStream {
    async fn recv(&mut self) -> Option<WsEvent> {
        match self.0.next().await {
            Some(Ok(Message::Text(text))) => Some(WsEvent::Text(text.to_string())),
            Some(Ok(Message::Close(_))) => Some(WsEvent::Closed),
            Some(Ok(_)) => Some(WsEvent::Other),
            Some(Err(e)) => {
                warn!("websocket read error: {e}");
                Some(WsEvent::Other)
            }
            None => None,
        }
    }
}
