// JSON envelope framing for WebSocket text frames.
//
// Every relay frame is a single JSON object `{"type": <name>, "data": <any>}`.
// This module converts between text frames and the message enums in
// `message.rs`:
// - `decode_server_frame` / `encode_client_frame`: the client's direction.
// - `encode_server_frame` / `decode_client_frame`: the relay's direction,
//   used by relay doubles in tests.
//
// A `MAX_FRAME_SIZE` constant (16 MB) rejects absurd frames before parsing.
// Memory snapshots are the largest expected client frames (a few KB as JSON);
// history replays in `new_items` are the largest server frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::{ClientMessage, ServerMessage};

/// Maximum accepted frame size in bytes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The `{type, data}` wrapper shared by every frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Parse a relay text frame.
pub fn decode_server_frame(text: &str) -> Result<ServerMessage, ProtocolError> {
    check_size(text.len())?;
    let envelope: Envelope = serde_json::from_str(text)?;
    ServerMessage::from_envelope(envelope)
}

pub fn encode_server_frame(message: &ServerMessage) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(&message.to_envelope()?)?;
    check_size(text.len())?;
    Ok(text)
}

/// Serialize a client message into a text frame.
pub fn encode_client_frame(message: &ClientMessage) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;
    check_size(text.len())?;
    Ok(text)
}

pub fn decode_client_frame(text: &str) -> Result<ClientMessage, ProtocolError> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatPayload;

    #[test]
    fn bare_type_frames_decode() {
        assert_eq!(
            decode_server_frame(r#"{"type":"connection_accepted"}"#).unwrap(),
            ServerMessage::ConnectionAccepted
        );
        assert_eq!(
            decode_server_frame(r#"{"type":"player_info_request","data":null}"#).unwrap(),
            ServerMessage::PlayerInfoRequest
        );
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let msg = decode_server_frame(r#"{"type":"weather_report","data":{"rain":true}}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown { ref kind, .. } if kind == "weather_report"));
    }

    #[test]
    fn text_chat_decodes_as_text() {
        let msg = decode_server_frame(r#"{"type":"chat","data":"Unknown command"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Chat(ChatPayload::Text("Unknown command".into())));
    }

    #[test]
    fn single_new_item_becomes_a_batch() {
        let msg = decode_server_frame(
            r#"{"type":"new_item","data":{"id":1,"to_player":2,"item_id":5,"event_idx":[0,1]}}"#,
        )
        .unwrap();
        let ServerMessage::NewItems(events) = msg else {
            panic!("expected new_items, got {msg:?}");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_name(), "new_item");
    }

    #[test]
    fn malformed_payload_names_the_frame_type() {
        let err = decode_server_frame(r#"{"type":"new_items","data":[{"from_player":"x"}]}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { ref kind, .. } if kind == "new_items"));
    }

    #[test]
    fn not_json_is_an_error() {
        assert!(matches!(
            decode_server_frame("hunter2"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let big = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            decode_server_frame(&big),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
