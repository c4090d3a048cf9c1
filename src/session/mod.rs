//! Session: multiplexes request/response, notify, and state-sync over a
//! single [`crate::transport::Transport`].
//!
//! Grounded on `hat.juggler.client.Client` and `hat.juggler.server.Connection`,
//! which both run one "process inbound message" loop on top of the raw
//! transport that dispatches each decoded [`Msg`] to the right subsystem.
//! Here that loop is [`Session::spawn`]'s dispatch loop.
//!
//! State sync is one-directional (server pushes, client mirrors): only the
//! server side runs a [`StateSync`] engine against its own `Storage`; both
//! sides apply inbound `state` diffs to a local `remote_state` mirror, which
//! on the client is the connection's public, read-only `state`.

pub mod requests;
pub mod state_sync;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::warn;

use crate::correlation::CorrelationTable;
use crate::msg::Msg;
use crate::storage::Storage;
use crate::transport::Transport;

pub use requests::{RequestClient, RequestDispatcher, RequestHandler, RequestMode};
pub use state_sync::StateSync;

/// A notification handler: invoked for every inbound `notify` message.
pub type NotifyHandler = std::sync::Arc<dyn Fn(String, Value) + Send + Sync>;

/// Invoke a user-supplied notify callback, catching a panic rather than
/// letting it unwind the dispatch loop task: "exceptions in the callback
/// close the client connection", not leave the connection half-alive with
/// its transport loops still running. Returns `false` on panic.
fn invoke_notify_handler(handler: &NotifyHandler, name: String, data: Value) -> bool {
    let handler = handler.clone();
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || handler(name, data))).is_ok()
}

/// Everything needed to drive one side of a connection on top of a
/// [`Transport`]. Cheaply cloneable: every field is itself a clone-sharing
/// handle.
#[derive(Clone)]
pub struct Session {
    /// Send-side handle for outbound requests.
    pub requests: RequestClient,
    /// The running state-sync engine, if this side owns the synced
    /// `Storage` (server role only — `None` on the client).
    pub state_sync: Option<StateSync>,
    /// The locally-owned `Storage` being synced out, if any (server role).
    pub local_state: Option<Storage>,
    /// The local mirror of the peer's `state`, updated from inbound `state`
    /// diffs. On the client this is the connection's public `state`; on the
    /// server it is unused in practice (the server never expects inbound
    /// `state` messages) but kept symmetric rather than special-cased away.
    pub remote_state: Storage,
}

/// Construction parameters for [`Session::spawn`], grouped because both the
/// server and client call sites otherwise pass an unwieldy number of
/// positional arguments.
pub struct SessionConfig {
    pub transport: Transport,
    /// `Some` on the server: the locally-owned `Storage` to sync out, and
    /// the coalescing policy for it. `None` on the client.
    pub local_state: Option<(Storage, Option<std::time::Duration>)>,
    /// Handler for inbound requests, if any; `None` means every non-empty
    /// request name fails with "not implemented" (the empty-name echo probe
    /// still works regardless).
    pub request_handler: Option<RequestHandler>,
    pub request_mode: RequestMode,
    pub notify_handler: Option<NotifyHandler>,
    pub inbound_rx: mpsc::Receiver<Msg>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl Session {
    /// Wire a session on top of `transport` per `config`, spawning its
    /// dispatch loop (and, for the server role, its state-sync loop) onto
    /// `tasks`.
    pub fn spawn(config: SessionConfig, tasks: &mut JoinSet<()>) -> Session {
        let SessionConfig {
            transport,
            local_state,
            request_handler,
            request_mode,
            notify_handler,
            mut inbound_rx,
            shutdown_tx,
        } = config;

        let correlation = CorrelationTable::new();
        let requests = RequestClient::new(transport.clone(), correlation.clone());
        let remote_state = Storage::new();

        let mut dispatcher = RequestDispatcher::new(transport.clone(), request_mode);
        if let Some(handler) = request_handler {
            dispatcher = dispatcher.with_handler(handler);
        }

        let owned_storage = local_state.as_ref().map(|(storage, _)| storage.clone());
        let state_sync = local_state.map(|(storage, autoflush_delay)| {
            StateSync::spawn(storage, transport.clone(), autoflush_delay, shutdown_tx.clone(), tasks)
        });

        let requests_for_loop = requests.clone();
        let remote_state_for_loop = remote_state.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut dispatch_tasks: JoinSet<()> = JoinSet::new();

        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    Some(_) = dispatch_tasks.join_next(), if !dispatch_tasks.is_empty() => {}
                    msg = inbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        match msg {
                            Msg::Request { id, name, data } => {
                                dispatcher.dispatch(id, name, data, &mut dispatch_tasks).await;
                            }
                            Msg::Response { id, success, data } => {
                                requests_for_loop.handle_response(id, success, data);
                            }
                            Msg::Notify { name, data } => {
                                if let Some(handler) = &notify_handler {
                                    let name_for_log = name.clone();
                                    if !invoke_notify_handler(handler, name, data) {
                                        warn!("notify handler panicked for {name_for_log:?}; closing connection");
                                        break;
                                    }
                                } else {
                                    warn!("dropping notify {name:?}: no handler registered");
                                }
                            }
                            Msg::State { diff } => {
                                let mut data = remote_state_for_loop.get();
                                if let Err(e) = json_patch::patch(&mut data, &diff) {
                                    warn!("protocol error applying state diff: {e}");
                                    break;
                                }
                                remote_state_for_loop.set(data);
                            }
                        }
                    }
                }
            }
            correlation.fail_all();
            let _ = shutdown_tx.send(());
        });

        Session {
            requests,
            state_sync,
            local_state: owned_storage,
            remote_state,
        }
    }
}
