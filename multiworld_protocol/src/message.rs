// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by the sync client to the relay.
// - `ServerMessage`: sent by the relay to the sync client.
//
// Both travel as JSON text frames shaped `{"type": ..., "data": ...}` (see
// `framing.rs`). `ClientMessage` maps onto that shape directly with serde's
// internally tagged representation; `player_info` is the one message whose
// fields sit beside `type` instead of under `data`, because that is where
// the relay reads them.
//
// `ServerMessage` is decoded by hand from an `Envelope` because the relay is
// loose about payload shapes: `chat` may carry an event object or a bare
// string, `new_items` may carry a list or (from older relays, as `new_item`)
// a single object. Unrecognized types decode to `ServerMessage::Unknown` so
// the caller can log and ignore them without failing the connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::event::RawEvent;
use crate::framing::Envelope;
use crate::types::PlayerSlot;

/// Device memory regions sent with `update_memory`, keyed by region name.
pub type MemorySnapshot = BTreeMap<String, Vec<u8>>;

/// Handshake identity reported once per connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub player_id: PlayerSlot,
    pub player_name: String,
    /// Loaded game signature; set for player identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_name: Option<String>,
    /// Account token; set for non-player identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

/// Messages sent by the client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PlayerInfo(PlayerInfo),
    Chat { data: String },
    /// Stop sending items to this player until resumed.
    PauseReceiving,
    ResumeReceiving,
    /// Device memory snapshot for relay-side progress tracking.
    UpdateMemory { data: MemorySnapshot },
}

/// Body of a `chat` frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatPayload {
    Event(RawEvent),
    /// Plain server text, e.g. a reply to an unknown chat command.
    Text(String),
}

/// Messages sent by the relay to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Transport accepted (password, if any, was correct).
    ConnectionAccepted,
    /// The relay wants a `player_info` message.
    PlayerInfoRequest,
    InitSuccess,
    PlayerJoin(RawEvent),
    PlayerLeave(RawEvent),
    PlayerPauseReceive(RawEvent),
    PlayerResumeReceive(RawEvent),
    PlayerForfeit(RawEvent),
    SessionCreate(RawEvent),
    Chat(ChatPayload),
    NewItems(Vec<RawEvent>),
    /// Acknowledges an `update_memory`.
    SramUpdated,
    NonPlayerDetected { message: Option<String> },
    Unknown { kind: String, data: Value },
}

impl ServerMessage {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { kind, data } = envelope;
        let event = |data: Value| -> Result<RawEvent, ProtocolError> {
            let mut raw: RawEvent = serde_json::from_value(data).map_err(|source| {
                ProtocolError::Payload {
                    kind: kind.clone(),
                    source,
                }
            })?;
            if raw.event_type.is_null() {
                raw.event_type = Value::String(kind.clone());
            }
            Ok(raw)
        };

        let message = match kind.as_str() {
            "connection_accepted" => Self::ConnectionAccepted,
            "player_info_request" => Self::PlayerInfoRequest,
            "init_success" => Self::InitSuccess,
            "sram_updated" => Self::SramUpdated,
            "player_join" => Self::PlayerJoin(event(data)?),
            "player_leave" => Self::PlayerLeave(event(data)?),
            "player_pause_receive" => Self::PlayerPauseReceive(event(data)?),
            "player_resume_receive" => Self::PlayerResumeReceive(event(data)?),
            "player_forfeit" => Self::PlayerForfeit(event(data)?),
            "session_create" => Self::SessionCreate(event(data)?),
            "chat" => match data {
                Value::String(text) => Self::Chat(ChatPayload::Text(text)),
                other => Self::Chat(ChatPayload::Event(event(other)?)),
            },
            "new_items" | "new_item" => {
                let items = match data {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                let mut events = Vec::with_capacity(items.len());
                for item in items {
                    let mut raw = event(item)?;
                    if raw.event_type.as_str() == Some(kind.as_str()) {
                        raw.event_type = Value::String("new_item".to_owned());
                    }
                    events.push(raw);
                }
                Self::NewItems(events)
            }
            "non_player_detected" => Self::NonPlayerDetected {
                message: match data {
                    Value::String(text) => Some(text),
                    other => other
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                },
            },
            _ => Self::Unknown { kind, data },
        };
        Ok(message)
    }

    /// Inverse of `from_envelope`, for relay-side tooling and tests.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let (kind, data) = match self {
            Self::ConnectionAccepted => ("connection_accepted", Value::Null),
            Self::PlayerInfoRequest => ("player_info_request", Value::Null),
            Self::InitSuccess => ("init_success", Value::Null),
            Self::SramUpdated => ("sram_updated", Value::Null),
            Self::PlayerJoin(raw) => ("player_join", serde_json::to_value(raw)?),
            Self::PlayerLeave(raw) => ("player_leave", serde_json::to_value(raw)?),
            Self::PlayerPauseReceive(raw) => ("player_pause_receive", serde_json::to_value(raw)?),
            Self::PlayerResumeReceive(raw) => {
                ("player_resume_receive", serde_json::to_value(raw)?)
            }
            Self::PlayerForfeit(raw) => ("player_forfeit", serde_json::to_value(raw)?),
            Self::SessionCreate(raw) => ("session_create", serde_json::to_value(raw)?),
            Self::Chat(ChatPayload::Text(text)) => ("chat", Value::String(text.clone())),
            Self::Chat(ChatPayload::Event(raw)) => ("chat", serde_json::to_value(raw)?),
            Self::NewItems(events) => ("new_items", serde_json::to_value(events)?),
            Self::NonPlayerDetected { message } => {
                ("non_player_detected", json!({ "message": message }))
            }
            Self::Unknown { kind, data } => {
                return Ok(Envelope {
                    kind: kind.clone(),
                    data: data.clone(),
                });
            }
        };
        Ok(Envelope {
            kind: kind.to_owned(),
            data,
        })
    }
}
