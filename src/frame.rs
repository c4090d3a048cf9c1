//! Wire framing: the single leading tag byte, segmentation, and reassembly.
//!
//! Every WebSocket TEXT frame juggler sends begins with one ASCII tag byte
//! (`'0'`..`'3'`) followed by a payload. This module is pure and
//! synchronous; [`crate::transport`] drives it against the actual socket.

/// Default maximum number of bytes per outbound segment.
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 64 * 1024;

/// A single outbound or inbound framed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Tag `'0'`: final segment of a message.
    Final(String),
    /// Tag `'1'`: non-final segment; more follow.
    NonFinal(String),
    /// Tag `'2'`: ping, carrying an opaque payload to be echoed back.
    Ping(String),
    /// Tag `'3'`: pong, answering a ping with an identical payload.
    Pong(String),
}

impl Frame {
    /// Render this frame as the literal text sent over the WebSocket.
    pub fn to_wire(&self) -> String {
        match self {
            Frame::Final(payload) => format!("0{payload}"),
            Frame::NonFinal(payload) => format!("1{payload}"),
            Frame::Ping(payload) => format!("2{payload}"),
            Frame::Pong(payload) => format!("3{payload}"),
        }
    }

    /// Parse a single WebSocket TEXT frame's content into a tagged `Frame`.
    ///
    /// Fails with [`crate::error::JugglerError::ProtocolError`] on an empty
    /// string or an unrecognized leading tag byte.
    pub fn from_wire(text: &str) -> Result<Self, crate::error::JugglerError> {
        let mut chars = text.chars();
        let tag = chars
            .next()
            .ok_or_else(|| crate::error::JugglerError::ProtocolError("empty frame".to_string()))?;
        let payload = chars.as_str().to_string();
        match tag {
            '0' => Ok(Frame::Final(payload)),
            '1' => Ok(Frame::NonFinal(payload)),
            '2' => Ok(Frame::Ping(payload)),
            '3' => Ok(Frame::Pong(payload)),
            other => Err(crate::error::JugglerError::ProtocolError(format!(
                "invalid frame tag: {other:?}"
            ))),
        }
    }
}

/// Split an encoded message string into the sequence of `Frame`s to send,
/// each carrying at most `max_segment_size` bytes of payload. Segments of
/// different messages must never be interleaved by the caller: this
/// function itself just produces one message's frames in order.
///
/// A message no larger than `max_segment_size` yields exactly one `Final`
/// frame; a larger one yields one or more `NonFinal` frames followed by a
/// single `Final` frame.
pub fn segment(encoded: &str, max_segment_size: usize) -> Vec<Frame> {
    debug_assert!(max_segment_size > 0, "max_segment_size must be positive");

    let bytes = encoded.as_bytes();
    if bytes.is_empty() {
        return vec![Frame::Final(String::new())];
    }

    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let end = char_boundary_chunk_end(bytes, pos, max_segment_size);
        let chunk = std::str::from_utf8(&bytes[pos..end])
            .expect("chunk boundary is always a valid utf-8 char boundary")
            .to_string();
        pos = end;
        if pos < bytes.len() {
            frames.push(Frame::NonFinal(chunk));
        } else {
            frames.push(Frame::Final(chunk));
        }
    }
    frames
}

/// Find the largest `end <= start + max_len` (capped at `bytes.len()`) that
/// lands on a UTF-8 character boundary, so segmentation never splits a
/// multi-byte codepoint across two frames.
fn char_boundary_chunk_end(bytes: &[u8], start: usize, max_len: usize) -> usize {
    let mut end = (start + max_len).min(bytes.len());
    while end > start && (bytes[end - 1] & 0b1100_0000) == 0b1000_0000 {
        end -= 1;
    }
    end
}

/// Buffers consecutive `NonFinal` payloads and, on a `Final` frame,
/// concatenates them and decodes the result as a [`crate::msg::Msg`].
///
/// Receiving a `Final` frame with an empty buffer is valid: it is a
/// single-segment message.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: String,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound `Frame`, returning the decoded message once a
    /// `Final` frame completes it.
    pub fn feed(&mut self, frame: Frame) -> Result<Option<crate::msg::Msg>, crate::error::JugglerError> {
        match frame {
            Frame::NonFinal(payload) => {
                self.buffer.push_str(&payload);
                Ok(None)
            }
            Frame::Final(payload) => {
                self.buffer.push_str(&payload);
                let data = std::mem::take(&mut self.buffer);
                let msg = crate::msg::Msg::decode(&data)?;
                Ok(Some(msg))
            }
            Frame::Ping(_) | Frame::Pong(_) => {
                // Heartbeat frames never carry message payload.
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Msg;
    use serde_json::json;

    #[test]
    fn small_message_is_single_final_segment() {
        let encoded = Msg::Request {
            id: 1,
            name: "x".to_string(),
            data: json!(null),
        }
        .encode()
        .unwrap();
        let frames = segment(&encoded, DEFAULT_MAX_SEGMENT_SIZE);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Final(_)));
    }

    #[test]
    fn oversized_message_yields_multiple_segments() {
        let big = "1".repeat(1000);
        let encoded = Msg::Notify {
            name: "n".to_string(),
            data: json!(big),
        }
        .encode()
        .unwrap();
        let frames = segment(&encoded, 64);
        assert!(frames.len() >= 2);
        for f in &frames[..frames.len() - 1] {
            assert!(matches!(f, Frame::NonFinal(_)));
        }
        assert!(matches!(frames.last().unwrap(), Frame::Final(_)));
    }

    #[test]
    fn segment_then_reassemble_round_trips_for_any_k() {
        let encoded = Msg::Notify {
            name: "hello".to_string(),
            data: json!({"a": [true, {}]}),
        }
        .encode()
        .unwrap();

        for k in [1usize, 2, 3, 7, 64, 1024] {
            let frames = segment(&encoded, k);
            let mut reasm = Reassembler::new();
            let mut result = None;
            for frame in frames {
                if let Some(msg) = reasm.feed(frame).unwrap() {
                    result = Some(msg);
                }
            }
            assert_eq!(result.unwrap(), Msg::decode(&encoded).unwrap());
        }
    }

    #[test]
    fn frame_wire_tags_round_trip() {
        for frame in [
            Frame::Final("a".to_string()),
            Frame::NonFinal("b".to_string()),
            Frame::Ping("c".to_string()),
            Frame::Pong("d".to_string()),
        ] {
            let wire = frame.to_wire();
            assert_eq!(Frame::from_wire(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        assert!(Frame::from_wire("9x").is_err());
    }

    #[test]
    fn empty_final_buffer_is_valid_single_segment_message() {
        let mut reasm = Reassembler::new();
        let encoded = Msg::Notify {
            name: "n".to_string(),
            data: json!(1),
        }
        .encode()
        .unwrap();
        let msg = reasm.feed(Frame::Final(encoded.clone())).unwrap().unwrap();
        assert_eq!(msg, Msg::decode(&encoded).unwrap());
    }
}
