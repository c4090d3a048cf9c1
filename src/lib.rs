//! A bidirectional, message-oriented session protocol over a single
//! WebSocket: shared JSON state synchronization (lazy, batched,
//! server-to-client) plus multiplexed request/response and fire-and-forget
//! notification.
//!
//! # Layout
//!
//! - [`transport`]: the wire framing, segmentation, and heartbeat against a
//!   live socket.
//! - [`session`]: request/response multiplexing ([`session::requests`]) and
//!   the state-sync engine ([`session::state_sync`]) on top of a transport.
//! - [`connection`]: the `Opening -> Open -> Closing -> Closed` lifecycle
//!   tying transport and session together.
//! - [`server`] / [`client`]: the accept (`listen`) and dial (`connect`)
//!   façades.
//! - [`auth`]: HTTP Basic auth against an htpasswd file.
//! - [`config`]: builder-style configuration for both façades.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod msg;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

pub use client::connect;
pub use config::{ClientConfig, ServerConfig};
pub use connection::{ConnState, Connection};
pub use error::{JugglerError, JugglerResult};
pub use msg::Msg;
pub use server::{listen, Server};
pub use session::{NotifyHandler, RequestHandler, RequestMode};
pub use storage::Storage;
pub use transport::{Transport, TransportConfig};

/// The JSON payload type carried by every `Msg` variant and by `Storage`.
/// Re-exported so application code can reference it without depending on
/// `serde_json` directly for simple cases.
pub type JugglerValue = serde_json::Value;
