//! Error taxonomy for the juggler protocol.

use thiserror::Error;

/// A specialized `Result` type for juggler operations.
pub type JugglerResult<T> = std::result::Result<T, JugglerError>;

/// Errors surfaced by the transport, session, and connection layers.
///
/// Variants correspond to the taxonomy in the protocol design: each one maps
/// to a single row of "kind -> meaning -> policy" and callers should match
/// on `JugglerError` rather than inspect the underlying cause.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum JugglerError {
    /// Peer closed, local close, or idle timeout. Surfaced to every pending
    /// waiter and every future call on the connection.
    #[error("disconnected")]
    Disconnected,

    /// The peer answered a request with `success: false`. The connection
    /// stays open; only the caller of `send` observes this.
    #[error("remote error: {0}")]
    RemoteError(serde_json::Value),

    /// Malformed JSON, an unknown frame tag, an unknown `type` discriminator,
    /// or an unexpected frame. Always closes the connection.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The heartbeat's idle timeout elapsed without an inbound frame.
    #[error("idle timeout")]
    IdleTimeout,

    /// Invalid configuration at startup (bad htpasswd entry, bind failure).
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for JugglerError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolError(err.to_string())
    }
}

impl From<std::io::Error> for JugglerError {
    fn from(err: std::io::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}
