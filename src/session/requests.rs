//! Request/response multiplexing.
//!
//! Two halves live in this module:
//!
//! - [`RequestClient`]: the caller side, grounded on `hat.juggler.client.Client.send`
//!   — allocate an id via [`crate::correlation::CorrelationTable`], enqueue a
//!   `request` message, await the matching `response`.
//! - [`RequestDispatcher`]: the callee side, grounded on
//!   `hat.juggler.server.Connection._process_request` — route an inbound
//!   `request` to the registered handler, in either `serialized` or
//!   `parallel` mode, and enqueue the `response`. The empty request name is
//!   reserved as a built-in round-trip echo probe, handled before the
//!   registered handler ever sees it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::warn;

use crate::correlation::CorrelationTable;
use crate::error::{JugglerError, JugglerResult};
use crate::msg::Msg;
use crate::transport::Transport;

/// A boxed, cloneable request handler: `(name, data) -> data or JugglerError`.
///
/// Grounded on the teacher's `RequestHandler` type in
/// `turbomcp-transport-traits::traits`, which likewise boxes an async
/// closure behind an `Arc` so it can be shared across connections and
/// spawned tasks without cloning the closure's captures.
pub type RequestHandler = Arc<
    dyn Fn(String, Value) -> Pin<Box<dyn Future<Output = JugglerResult<Value>> + Send>>
        + Send
        + Sync,
>;

/// How inbound requests are dispatched to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Requests are handled one at a time, in arrival order; a slow handler
    /// delays every request queued behind it.
    #[default]
    Serialized,
    /// Each request is dispatched onto its own task; responses may complete
    /// out of order.
    Parallel,
}

/// The caller side of request/response: allocates ids, sends `request`
/// messages, and resolves the matching placeholder when a `response`
/// arrives.
#[derive(Clone)]
pub struct RequestClient {
    transport: Transport,
    table: CorrelationTable,
}

impl RequestClient {
    /// Wrap `transport`, using `table` for id allocation and correlation.
    pub fn new(transport: Transport, table: CorrelationTable) -> Self {
        Self { transport, table }
    }

    /// Send a request and await its response.
    ///
    /// Fails with [`JugglerError::RemoteError`] if the peer's handler raised,
    /// or [`JugglerError::Disconnected`] if the connection drops before a
    /// response arrives.
    pub async fn request(&self, name: impl Into<String>, data: Value) -> JugglerResult<Value> {
        let id = self.table.next_id();
        let rx = self.table.register(id);

        if let Err(e) = self
            .transport
            .send(Msg::Request {
                id,
                name: name.into(),
                data,
            })
            .await
        {
            self.table.cancel(id);
            return Err(e);
        }

        rx.await.map_err(|_| JugglerError::Disconnected)?
    }

    /// Feed a decoded `response` message to the correlation table. A no-op
    /// if `id` is unknown (already resolved, or never ours).
    pub fn handle_response(&self, id: u64, success: bool, data: Value) {
        let outcome = if success {
            Ok(data)
        } else {
            Err(JugglerError::RemoteError(data))
        };
        self.table.resolve(id, outcome);
    }
}

/// The callee side of request/response: routes inbound `request` messages to
/// a handler and enqueues the `response`.
#[derive(Clone)]
pub struct RequestDispatcher {
    transport: Transport,
    handler: Option<RequestHandler>,
    mode: RequestMode,
}

impl RequestDispatcher {
    /// Build a dispatcher with no handler registered: every non-empty
    /// request name fails with a "not implemented" response.
    pub fn new(transport: Transport, mode: RequestMode) -> Self {
        Self {
            transport,
            handler: None,
            mode,
        }
    }

    /// Register the handler invoked for every non-empty request name.
    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Handle one inbound `request`, dispatching per `mode`.
    ///
    /// In [`RequestMode::Parallel`] this spawns the handler invocation onto
    /// `tasks` and returns once it's scheduled; in
    /// [`RequestMode::Serialized`] it awaits the handler inline before
    /// returning, so the caller's receive loop naturally serializes the next
    /// request behind it.
    pub async fn dispatch(&self, id: u64, name: String, data: Value, tasks: &mut JoinSet<()>) {
        match self.mode {
            RequestMode::Serialized => {
                let outcome = Self::resolve(&self.handler, name, data).await;
                self.respond(id, outcome).await;
            }
            RequestMode::Parallel => {
                let transport = self.transport.clone();
                let handler = self.handler.clone();
                tasks.spawn(async move {
                    let outcome = Self::resolve(&handler, name, data).await;
                    let response = Self::to_response(id, outcome);
                    if transport.send(response).await.is_err() {
                        warn!("request dispatcher: failed to send response for id {id}, connection gone");
                    }
                });
            }
        }
    }

    async fn resolve(handler: &Option<RequestHandler>, name: String, data: Value) -> JugglerResult<Value> {
        if name.is_empty() {
            // The round-trip echo probe: always succeeds, regardless of
            // whether a handler is registered.
            return Ok(data);
        }
        match handler {
            Some(h) => h(name, data).await,
            None => Err(JugglerError::RemoteError(Value::String(format!(
                "no handler registered for request {name:?}"
            )))),
        }
    }

    fn to_response(id: u64, outcome: JugglerResult<Value>) -> Msg {
        match outcome {
            Ok(data) => Msg::Response {
                id,
                success: true,
                data,
            },
            Err(JugglerError::RemoteError(data)) => Msg::Response {
                id,
                success: false,
                data,
            },
            Err(e) => Msg::Response {
                id,
                success: false,
                data: Value::String(e.to_string()),
            },
        }
    }

    async fn respond(&self, id: u64, outcome: JugglerResult<Value>) {
        let response = Self::to_response(id, outcome);
        if self.transport.send(response).await.is_err() {
            warn!("request dispatcher: failed to send response for id {id}, connection gone");
        }
    }
}
