//! Transport: frame codec driven against a live WebSocket, segmentation,
//! reassembly, heartbeat, and the bounded outbound queue.
//!
//! Grounded on `hat.juggler.transport.Transport`'s three loops
//! (`_receive_loop`, `_send_loop`, `_ping_loop`), re-expressed the way the
//! teacher structures background tasks in `turbomcp-websocket::tasks`: one
//! `tokio::spawn`ed loop per concern, each subscribing to a shared
//! `tokio::sync::broadcast` shutdown signal via `tokio::select!`, and a
//! shared `Arc<Mutex<_>>`-guarded sink so the ping loop and the pong
//! auto-responder (both control-frame writers) can write alongside the
//! segmented-message sender without owning the socket exclusively — the
//! same shape as the teacher's `writer: WebSocketWriter` field shared
//! between its message-reader and keep-alive tasks.
//!
//! This module is socket-agnostic: [`WsSink`] and [`WsStream`] abstract over
//! the server side's `axum` WebSocket and the client side's
//! `tokio-tungstenite` stream, since the two expose incompatible concrete
//! `Message` types but the same conceptual text-frame protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::error::{JugglerError, JugglerResult};
use crate::frame::{segment, Frame, Reassembler};
use crate::msg::Msg;

/// Default outbound queue depth.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1024;
/// Default heartbeat delay before a ping is sent.
pub const DEFAULT_PING_DELAY: Duration = Duration::from_secs(30);
/// Default heartbeat timeout after a ping before the connection fails.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-layer tuning knobs; one set per connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum bytes of JSON payload per outbound segment.
    pub max_segment_size: usize,
    /// Outbound queue depth before `send` suspends.
    pub send_queue_size: usize,
    /// Idle delay before a heartbeat ping is emitted.
    pub ping_delay: Duration,
    /// Additional idle delay after a ping before the connection fails.
    pub ping_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_segment_size: crate::frame::DEFAULT_MAX_SEGMENT_SIZE,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            ping_delay: DEFAULT_PING_DELAY,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

/// An inbound event surfaced by the underlying WebSocket once stripped of
/// everything but what this protocol cares about: text payloads and
/// connection termination. Any other WebSocket-level frame (binary, an
/// RFC 6455 control frame, an extension frame) is, per the wire contract, a
/// protocol error — this protocol's heartbeat lives entirely inside TEXT
/// frames (tags `2`/`3`) and never touches RFC 6455 ping/pong.
pub enum WsEvent {
    /// A TEXT frame's contents.
    Text(String),
    /// The peer closed the WebSocket cleanly.
    Closed,
    /// Anything else: binary data, a control frame, or a read error.
    Other,
}

/// Abstracts writing TEXT frames to the underlying WebSocket.
#[async_trait]
pub trait WsSink: Send {
    /// Send one TEXT frame.
    async fn send_text(&mut self, text: String) -> JugglerResult<()>;
    /// Best-effort close of the underlying socket. Idempotent.
    async fn close(&mut self);
}

/// Abstracts reading frames from the underlying WebSocket.
#[async_trait]
pub trait WsStream: Send {
    /// Read the next event; `None` means the stream is exhausted.
    async fn recv(&mut self) -> Option<WsEvent>;
}

/// A handle to a running transport: the place to enqueue outbound messages
/// and to trigger (or observe) a shared-scope shutdown.
#[derive(Clone)]
pub struct Transport {
    outbound_tx: mpsc::Sender<Msg>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    /// Spawn the receive, send, and ping loops onto `tasks`, wiring them to
    /// `shutdown_tx` (owned by the caller's connection-wide task scope) and
    /// forwarding decoded inbound messages, strictly one at a time and in
    /// wire order, to `inbound_tx`.
    pub fn spawn(
        sink: Box<dyn WsSink>,
        stream: Box<dyn WsStream>,
        config: TransportConfig,
        inbound_tx: mpsc::Sender<Msg>,
        shutdown_tx: broadcast::Sender<()>,
        tasks: &mut JoinSet<()>,
    ) -> Transport {
        let sink = Arc::new(Mutex::new(sink));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_size);
        let (activity_tx, _activity_rx) = broadcast::channel::<()>(16);

        tasks.spawn(receive_loop(
            stream,
            sink.clone(),
            inbound_tx,
            activity_tx.clone(),
            shutdown_tx.clone(),
        ));
        tasks.spawn(send_loop(
            sink.clone(),
            outbound_rx,
            config.max_segment_size,
            shutdown_tx.clone(),
        ));
        tasks.spawn(ping_loop(
            sink,
            activity_tx,
            config.ping_delay,
            config.ping_timeout,
            shutdown_tx.clone(),
        ));

        Transport {
            outbound_tx,
            shutdown_tx,
        }
    }

    /// Enqueue a message for sending. Suspends when the outbound queue is
    /// full (backpressure, not an error); fails with
    /// [`JugglerError::Disconnected`] once the connection is closing.
    pub async fn send(&self, msg: Msg) -> JugglerResult<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| JugglerError::Disconnected)
    }

    /// Signal every loop sharing this shutdown channel to stop.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn receive_loop(
    mut stream: Box<dyn WsStream>,
    sink: Arc<Mutex<Box<dyn WsSink>>>,
    inbound_tx: mpsc::Sender<Msg>,
    activity_tx: broadcast::Sender<()>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut reassembler = Reassembler::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("receive loop stopping: shutdown signaled");
                break;
            }
            event = stream.recv() => {
                match event {
                    Some(WsEvent::Text(text)) => {
                        let _ = activity_tx.send(());
                        match Frame::from_wire(&text) {
                            Ok(Frame::Ping(payload)) => {
                                trace!("replying to heartbeat ping");
                                if sink.lock().await.send_text(Frame::Pong(payload).to_wire()).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Frame::Pong(_)) => {
                                // Only satisfies the idle timer; handled above.
                            }
                            Ok(frame @ (Frame::Final(_) | Frame::NonFinal(_))) => {
                                match reassembler.feed(frame) {
                                    Ok(Some(msg)) => {
                                        if inbound_tx.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        warn!("protocol error reassembling message: {e}");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("protocol error decoding frame: {e}");
                                break;
                            }
                        }
                    }
                    Some(WsEvent::Closed) => {
                        debug!("peer closed websocket");
                        break;
                    }
                    Some(WsEvent::Other) | None => {
                        break;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
}

async fn send_loop(
    sink: Arc<Mutex<Box<dyn WsSink>>>,
    mut outbound_rx: mpsc::Receiver<Msg>,
    max_segment_size: usize,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("send loop stopping: shutdown signaled");
                break;
            }
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let encoded = match msg.encode() {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to encode outbound message: {e}");
                        continue;
                    }
                };
                let frames = segment(&encoded, max_segment_size);
                let mut failed = false;
                for frame in frames {
                    if sink.lock().await.send_text(frame.to_wire()).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    warn!("send loop: underlying socket send failed");
                    break;
                }
            }
        }
    }

    sink.lock().await.close().await;
    let _ = shutdown_tx.send(());
}

/// Emits a `2` ping when `ping_delay` elapses without inbound activity, then
/// fails the connection with [`JugglerError::IdleTimeout`] if a further
/// `ping_timeout` elapses with still no activity.
async fn ping_loop(
    sink: Arc<Mutex<Box<dyn WsSink>>>,
    activity_tx: broadcast::Sender<()>,
    ping_delay: Duration,
    ping_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    'outer: loop {
        let mut activity_rx = activity_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            res = tokio::time::timeout(ping_delay, activity_rx.recv()) => {
                if res.is_ok() {
                    // Activity observed within the delay window; restart.
                    continue 'outer;
                }
            }
        }

        trace!("idle for ping_delay, sending heartbeat ping");
        if sink.lock().await.send_text(Frame::Ping(String::new()).to_wire()).await.is_err() {
            break;
        }

        let mut activity_rx = activity_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            res = tokio::time::timeout(ping_timeout, activity_rx.recv()) => {
                if res.is_err() {
                    warn!("idle timeout: no activity within ping_timeout");
                    break;
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc as tmpsc;

    /// An in-memory `WsSink`/`WsStream` pair backed by channels, used to
    /// drive the transport loops in tests without a real socket.
    struct ChannelSink(tmpsc::UnboundedSender<String>);

    #[async_trait]
    impl WsSink for ChannelSink {
        async fn send_text(&mut self, text: String) -> JugglerResult<()> {
            self.0.send(text).map_err(|_| JugglerError::Disconnected)
        }
        async fn close(&mut self) {}
    }

    struct ChannelStream(tmpsc::UnboundedReceiver<WsEventLike>);

    enum WsEventLike {
        Text(String),
        Closed,
    }

    #[async_trait]
    impl WsStream for ChannelStream {
        async fn recv(&mut self) -> Option<WsEvent> {
            match self.0.recv().await {
                Some(WsEventLike::Text(t)) => Some(WsEvent::Text(t)),
                Some(WsEventLike::Closed) | None => Some(WsEvent::Closed),
            }
        }
    }

    #[tokio::test]
    async fn send_segments_and_writes_frames_in_order() {
        let (out_tx, mut out_rx) = tmpsc::unbounded_channel();
        let (_in_tx, _in_rx) = tmpsc::unbounded_channel::<WsEventLike>();
        let sink = ChannelSink(out_tx);
        let stream = ChannelStream(_in_rx);

        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut tasks = JoinSet::new();

        let transport = Transport::spawn(
            Box::new(sink),
            Box::new(stream),
            TransportConfig {
                max_segment_size: 8,
                ..Default::default()
            },
            inbound_tx,
            shutdown_tx,
            &mut tasks,
        );

        transport
            .send(Msg::Notify {
                name: "n".to_string(),
                data: serde_json::json!("1234567890"),
            })
            .await
            .unwrap();

        let first = out_rx.recv().await.unwrap();
        assert!(first.starts_with('1'), "non-final segment tagged 1: {first}");

        transport.close();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn receive_reassembles_and_forwards_one_message() {
        let (out_tx, _out_rx) = tmpsc::unbounded_channel();
        let (in_tx, in_rx) = tmpsc::unbounded_channel();
        let sink = ChannelSink(out_tx);
        let stream = ChannelStream(in_rx);

        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut tasks = JoinSet::new();

        let msg = Msg::Notify {
            name: "hi".to_string(),
            data: serde_json::json!(1),
        };
        let encoded = msg.encode().unwrap();

        let _transport = Transport::spawn(
            Box::new(sink),
            Box::new(stream),
            TransportConfig::default(),
            inbound_tx,
            shutdown_tx.clone(),
            &mut tasks,
        );

        in_tx
            .send(WsEventLike::Text(format!("0{encoded}")))
            .unwrap();

        let received = inbound_rx.recv().await.unwrap();
        assert_eq!(received, msg);

        let _ = shutdown_tx.send(());
        while tasks.join_next().await.is_some() {}
    }
}
