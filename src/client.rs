//! `connect`: dial side. Opens a WebSocket to a remote juggler server and
//! wires it into a [`Connection`] with no locally-owned state (the client
//! only ever mirrors the server's `state`).
//!
//! Grounded on `hat.juggler.client.connect`: dial, clean up the HTTP session
//! uncancellably on failure, then build the connection. The dial itself
//! follows the teacher's `connect_async` usage in `turbomcp-websocket::tasks`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::warn;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{JugglerError, JugglerResult};
use crate::session::{NotifyHandler, RequestMode};
use crate::transport::{TransportConfig, WsEvent, WsSink, WsStream};

/// Dial `config.address`, returning a [`Connection`] once the WebSocket
/// handshake completes.
///
/// `notify_handler` receives inbound notifications pushed by the server.
/// The client never owns synced state (`Connection::flush` always fails on
/// a dialed connection) and never dispatches inbound requests, since the
/// protocol does not expect servers to send any.
pub async fn connect(config: ClientConfig, notify_handler: Option<NotifyHandler>) -> JugglerResult<Connection> {
    let ClientConfig {
        address,
        auth,
        connector,
        send_queue_size,
        max_segment_size,
        ping_delay,
        ping_timeout,
    } = config;

    let mut request = address
        .as_str()
        .into_client_request()
        .map_err(|e| JugglerError::ConfigError(format!("invalid address {address:?}: {e}")))?;

    if let Some((user, password)) = &auth {
        use base64::Engine;
        let credentials = format!("{user}:{password}");
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Basic {encoded}")
                .parse()
                .map_err(|_| JugglerError::ConfigError("invalid basic-auth header value".to_string()))?,
        );
    }

    let ws_stream = match connector {
        Some(connector) => {
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector)).await
        }
        None => tokio_tungstenite::connect_async(request).await,
    };

    let (ws_stream, _response) = ws_stream.map_err(|e| JugglerError::ConfigError(format!("dial failed: {e}")))?;

    let (sink, stream) = ws_stream.split();

    let connection = Connection::spawn(ConnectionConfig {
        sink: Box::new(TungsteniteSink(sink)),
        stream: Box::new(TungsteniteStream(stream)),
        transport_config: TransportConfig {
            max_segment_size,
            send_queue_size,
            ping_delay,
            ping_timeout,
        },
        shutdown_timeout: Duration::from_millis(100),
        local_state: None,
        request_handler: None,
        request_mode: RequestMode::Serialized,
        notify_handler,
    });

    Ok(connection)
}

type TungsteniteWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TungsteniteSink(futures::stream::SplitSink<TungsteniteWs, Message>);

#[async_trait]
impl WsSink for TungsteniteSink {
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

struct TungsteniteStream(futures::stream::SplitStream<TungsteniteWs>);

#[async_trait]
impl WsStream for TungsteniteStream {
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
