//! Connection: the `OPENING -> OPEN -> CLOSING -> CLOSED` lifecycle and
//! per-connection task scope tying transport + session together.
//!
//! Grounded on `hat.juggler.server.Connection` / `hat.juggler.client.Client`,
//! both of which are "a WebSocket plus a `Group` of background tasks plus a
//! small state machine"; here the `Group` becomes a `tokio::task::JoinSet`
//! and the shutdown signal a `tokio::sync::broadcast` channel, matching the
//! teacher's `turbomcp-websocket::tasks` task-scope shape.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{JugglerError, JugglerResult};
use crate::msg::Msg;
use crate::session::{NotifyHandler, RequestHandler, RequestMode, Session, SessionConfig};
use crate::storage::Storage;
use crate::transport::{Transport, TransportConfig, WsSink, WsStream};

/// Default grace period for a connection's close to drain its task scope.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

/// Invoked once per newly established connection, on both the accept and
/// dial side, with a handle the caller can stash, `notify` through, mutate
/// `storage()` on, or `close()`.
pub type ConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// The connection lifecycle state machine. Transitions are monotone:
/// `Opening -> Open -> Closing -> Closed`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnState::Opening,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Everything needed to bring up a connection's transport + session + task
/// scope. Shared by the server accept path and the client dial path.
pub struct ConnectionConfig {
    pub sink: Box<dyn WsSink>,
    pub stream: Box<dyn WsStream>,
    pub transport_config: TransportConfig,
    pub shutdown_timeout: Duration,
    /// `Some((storage, autoflush_delay))` on the server; `None` on the client.
    pub local_state: Option<(Storage, Option<Duration>)>,
    pub request_handler: Option<RequestHandler>,
    pub request_mode: RequestMode,
    pub notify_handler: Option<NotifyHandler>,
}

/// A live juggler connection: request/response, notify, and state sync over
/// one WebSocket. Cheaply cloneable; every clone shares the same underlying
/// transport, session, task scope, and lifecycle state.
#[derive(Clone)]
pub struct Connection {
    transport: Transport,
    session: Session,
    state: Arc<AtomicU8>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Connection {
    /// Bring up transport, session, and task scope for one accepted or
    /// dialed WebSocket, per `config`.
    pub fn spawn(config: ConnectionConfig) -> Connection {
        let ConnectionConfig {
            sink,
            stream,
            transport_config,
            shutdown_timeout,
            local_state,
            request_handler,
            request_mode,
            notify_handler,
        } = config;

        let (shutdown_tx, _) = broadcast::channel(16);
        let mut tasks = JoinSet::new();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Msg>(transport_config.send_queue_size);

        let transport = Transport::spawn(sink, stream, transport_config, inbound_tx, shutdown_tx.clone(), &mut tasks);

        let session = Session::spawn(
            SessionConfig {
                transport: transport.clone(),
                local_state,
                request_handler,
                request_mode,
                notify_handler,
                inbound_rx,
                shutdown_tx: shutdown_tx.clone(),
            },
            &mut tasks,
        );

        Connection {
            transport,
            session,
            state: Arc::new(AtomicU8::new(ConnState::Open as u8)),
            tasks: Arc::new(Mutex::new(tasks)),
            shutdown_tx,
            shutdown_timeout,
        }
    }

    /// The connection's current lifecycle state.
    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::SeqCst))
    }

    /// Shorthand for `state() == ConnState::Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// The JSON document this connection exposes to the application: the
    /// locally-owned, writable `Storage` on the server side, or the
    /// read-only remote mirror on the client side.
    pub fn storage(&self) -> Storage {
        self.session
            .local_state
            .clone()
            .unwrap_or_else(|| self.session.remote_state.clone())
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, name: impl Into<String>, data: Value) -> JugglerResult<()> {
        if self.is_closing_or_closed() {
            return Err(JugglerError::Disconnected);
        }
        self.transport
            .send(Msg::Notify { name: name.into(), data })
            .await
    }

    /// Send a request and await its response.
    pub async fn request(&self, name: impl Into<String>, data: Value) -> JugglerResult<Value> {
        if self.is_closing_or_closed() {
            return Err(JugglerError::Disconnected);
        }
        self.session.requests.request(name, data).await
    }

    /// Force synchronization of locally-owned state. Only meaningful on a
    /// server-side connection (one constructed with `local_state: Some`);
    /// fails with [`JugglerError::ProtocolError`] otherwise.
    pub async fn flush(&self) -> JugglerResult<()> {
        if self.is_closing_or_closed() {
            return Err(JugglerError::Disconnected);
        }
        match &self.session.state_sync {
            Some(sync) => sync.flush().await,
            None => Err(JugglerError::ProtocolError(
                "flush() is only available on a connection with locally-owned state".to_string(),
            )),
        }
    }

    fn is_closing_or_closed(&self) -> bool {
        matches!(self.state(), ConnState::Closing | ConnState::Closed)
    }

    /// Wait until some part of the connection (transport or session)
    /// initiates shutdown, e.g. because the peer disconnected or the
    /// heartbeat timed out. Does not itself change `state()`; callers that
    /// want the task scope drained afterwards should follow up with
    /// [`Connection::close`].
    pub async fn wait_closed(&self) {
        if self.is_closing_or_closed() {
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
    }

    /// Close the connection: idempotent, safe to call concurrently from
    /// multiple clones. Marks `Closing`, fails every pending waiter, shuts
    /// down the transport, then waits up to `shutdown_timeout` for the task
    /// scope to drain before aborting whatever remains and marking `Closed`.
    pub async fn close(&self) {
        let prior = self
            .state
            .swap(ConnState::Closing as u8, Ordering::SeqCst);
        if ConnState::from(prior) != ConnState::Opening && ConnState::from(prior) != ConnState::Open {
            // Someone else already initiated (or finished) closing.
            return;
        }

        self.transport.close();
        let _ = self.shutdown_tx.send(());

        let mut tasks = self.tasks.lock().await;
        loop {
            match tokio::time::timeout(self.shutdown_timeout, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!("connection close: shutdown_timeout elapsed, aborting remaining tasks");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
        debug!("connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RequestMode;
    use crate::transport::WsEvent;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc as tmpsc;

    struct ChannelSink(tmpsc::UnboundedSender<String>);
    #[async_trait]
    impl WsSink for ChannelSink {
        async fn send_text(&mut self, text: String) -> JugglerResult<()> {
            self.0.send(text).map_err(|_| JugglerError::Disconnected)
        }
        async fn close(&mut self) {}
    }

    struct PendingStream;
    #[async_trait]
    impl WsStream for PendingStream {
        async fn recv(&mut self) -> Option<WsEvent> {
            std::future::pending().await
        }
    }

    fn basic_config() -> (ConnectionConfig, tmpsc::UnboundedReceiver<String>) {
        let (tx, rx) = tmpsc::unbounded_channel();
        let config = ConnectionConfig {
            sink: Box::new(ChannelSink(tx)),
            stream: Box::new(PendingStream),
            transport_config: TransportConfig::default(),
            shutdown_timeout: Duration::from_millis(50),
            local_state: Some((Storage::new(), Some(Duration::ZERO))),
            request_handler: None,
            request_mode: RequestMode::Serialized,
            notify_handler: None,
        };
        (config, rx)
    }

    #[tokio::test]
    async fn starts_open_and_closes_idempotently() {
        let (config, _rx) = basic_config();
        let conn = Connection::spawn(config);
        assert_eq!(conn.state(), ConnState::Open);

        conn.close().await;
        assert_eq!(conn.state(), ConnState::Closed);

        // Second close is a silent no-op, not a panic or a state regression.
        conn.close().await;
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn notify_after_close_fails_with_disconnected() {
        let (config, _rx) = basic_config();
        let conn = Connection::spawn(config);
        conn.close().await;

        let err = conn.notify("n", json!(1)).await.unwrap_err();
        assert!(matches!(err, JugglerError::Disconnected));
    }

    #[tokio::test]
    async fn flush_works_when_local_state_is_configured() {
        let (config, _rx) = basic_config();
        let conn = Connection::spawn(config);
        conn.storage().set(json!(1));
        conn.flush().await.unwrap();
        conn.close().await;
    }
}
