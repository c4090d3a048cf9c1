//! Decoded application-level messages exchanged over a juggler session.
//!
//! A `Msg` is a JSON object discriminated by its `type` field. Unknown
//! `type` values are a protocol error at the point of decode (see
//! [`crate::error::JugglerError::ProtocolError`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded juggler protocol message.
///
/// Serializes to / deserializes from the four wire schemas in the protocol
/// design: `request`, `response`, `notify`, and `state`. The `type` field is
/// used as an internally-tagged discriminator, matching the wire shape
/// exactly (no `content`/`data` wrapper level beyond what each variant already
/// carries).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Msg {
    /// `{type:"request", id, name, data}` — endpoint-unique, monotonic `id`.
    #[serde(rename = "request")]
    Request {
        /// Request id, unique per sender session, starting at 1.
        id: u64,
        /// Request name; the empty string is the round-trip echo probe.
        name: String,
        /// Request payload.
        data: Value,
    },

    /// `{type:"response", id, success, data}` — echoes the request `id`.
    #[serde(rename = "response")]
    Response {
        /// The id of the request this response answers.
        id: u64,
        /// `true` if the handler returned a value, `false` if it raised.
        success: bool,
        /// The returned value, or a human-readable error description.
        data: Value,
    },

    /// `{type:"notify", name, data}` — no id, no response expected.
    #[serde(rename = "notify")]
    Notify {
        /// Notification name.
        name: String,
        /// Notification payload.
        data: Value,
    },

    /// `{type:"state", diff}` — an RFC 6902 JSON-Patch document.
    #[serde(rename = "state")]
    State {
        /// Patch that, applied to the receiver's last synced value, yields
        /// the sender's current value.
        diff: json_patch::Patch,
    },
}

impl Msg {
    /// Encode this message as a compact JSON string, as sent on the wire.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a message from a JSON string fragment (after reassembly).
    pub fn decode(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let msg = Msg::Request {
            id: 7,
            name: "ping".to_string(),
            data: json!({"a": [true, {}]}),
        };
        let encoded = msg.encode().unwrap();
        let decoded = Msg::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn response_failure_carries_json_data() {
        let msg = Msg::Response {
            id: 1,
            success: false,
            data: json!("error"),
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.contains("\"success\":false"));
        let decoded = Msg::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let err = Msg::decode(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(err.to_string().len() > 0);
    }

    #[test]
    fn empty_name_request_is_valid() {
        let msg = Msg::Request {
            id: 1,
            name: String::new(),
            data: json!(42),
        };
        let encoded = msg.encode().unwrap();
        let decoded = Msg::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }
}
