// Session events: the loose wire shape and the typed form the client keeps.
//
// The relay produces events from two places that disagree on details. Live
// frames carry `timestamp` in seconds and put item fields at the top level;
// the historical HTTP endpoint returns database rows whose `event_type` is a
// small integer enum and whose `timestamp` is an RFC 3339 string. `RawEvent`
// accepts both shapes; `RawEvent::into_event()` normalizes them into an
// `Event` with millisecond timestamps and an `EventKind` tagged union.
//
// Unknown event types are preserved as `EventKind::Unknown` with their raw
// payload rather than being dropped, so they still show up in the log.
//
// `ItemEvent` is the narrow view of a `new_item` event that the delivery
// queue works with: sequence key, item byte, sender. Only events that carry a
// sequence key and a device-sized item id project into one.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventId, PlayerSlot, SequenceKey};

/// Numeric event type codes used by the relay's database.
const NUMERIC_EVENT_TYPES: [(u64, &str); 8] = [
    (1, "session_create"),
    (2, "player_join"),
    (3, "failed_join"),
    (4, "player_leave"),
    (5, "chat"),
    (6, "command"),
    (7, "new_item"),
    (8, "player_forfeit"),
];

/// An event as it appears on the wire, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    /// Seconds since the epoch, or an RFC 3339 string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Event name, or the numeric database code.
    #[serde(default)]
    pub event_type: Value,
    #[serde(default)]
    pub from_player: PlayerSlot,
    #[serde(default)]
    pub to_player: PlayerSlot,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub event_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_idx: Option<SequenceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<i64>,
}

impl RawEvent {
    /// Canonical name of this event's type.
    pub fn type_name(&self) -> String {
        match &self.event_type {
            Value::String(name) => name.clone(),
            Value::Number(n) => n
                .as_u64()
                .and_then(|code| {
                    NUMERIC_EVENT_TYPES
                        .iter()
                        .find(|(c, _)| *c == code)
                        .map(|(_, name)| (*name).to_owned())
                })
                .unwrap_or_else(|| n.to_string()),
            _ => "unknown".to_owned(),
        }
    }

    /// Normalize into a typed event. Missing ids get a fresh local token;
    /// missing or unparseable timestamps fall back to the current time.
    pub fn into_event(self, historical: bool) -> Event {
        let timestamp_ms = self
            .timestamp
            .as_ref()
            .and_then(parse_timestamp_ms)
            .or_else(|| self.event_data.get("timestamp").and_then(parse_timestamp_ms))
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let kind = EventKind::from_raw(&self);
        Event {
            id: self.id.unwrap_or_else(EventId::local),
            timestamp_ms,
            kind,
            from_player: self.from_player,
            to_player: self.to_player,
            session_id: self.session_id,
            historical,
        }
    }
}

fn parse_timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(seconds_to_ms),
        Value::String(s) => {
            if let Ok(secs) = s.parse::<f64>() {
                return Some(seconds_to_ms(secs));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            // Naive database timestamps are UTC.
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn seconds_to_ms(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

/// Fields of a `new_item` event, gathered from the top level and from
/// `event_data` (the two sources disagree on where they live).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemData {
    pub event_idx: Option<SequenceKey>,
    pub item_id: i64,
    pub item_name: Option<String>,
    pub location: i64,
    pub location_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatData {
    pub message: String,
    /// Relay-side chat category, when present (e.g. "system").
    pub chat_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerData {
    pub player_id: Option<i32>,
    pub player_name: Option<String>,
}

/// Lenient view over `event_data`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DataFields {
    message: Option<String>,
    #[serde(rename = "type")]
    chat_type: Option<String>,
    player_id: Option<i32>,
    player_name: Option<String>,
    name: Option<String>,
    item_id: Option<i64>,
    item_name: Option<String>,
    location: Option<i64>,
    location_name: Option<String>,
    event_idx: Option<SequenceKey>,
}

/// Typed event payload.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    SessionCreate,
    PlayerJoin(PlayerData),
    FailedJoin(PlayerData),
    PlayerLeave(PlayerData),
    PlayerForfeit(PlayerData),
    PlayerPauseReceive(PlayerData),
    PlayerResumeReceive(PlayerData),
    Chat(ChatData),
    Command(ChatData),
    NewItem(ItemData),
    InitSuccess,
    Unknown { event_type: String, data: Value },
}

impl EventKind {
    fn from_raw(raw: &RawEvent) -> Self {
        let event_type = raw.type_name();
        // A bare string payload is a message body.
        let fields: DataFields = match &raw.event_data {
            Value::String(s) => DataFields {
                message: Some(s.clone()),
                ..DataFields::default()
            },
            Value::Object(_) => serde_json::from_value(raw.event_data.clone()).unwrap_or_default(),
            _ => DataFields::default(),
        };
        let player = || PlayerData {
            player_id: fields.player_id,
            player_name: fields.player_name.clone().or_else(|| fields.name.clone()),
        };
        let chat = || ChatData {
            message: fields.message.clone().unwrap_or_default(),
            chat_type: fields.chat_type.clone(),
        };
        match event_type.as_str() {
            "session_create" => Self::SessionCreate,
            "player_join" => Self::PlayerJoin(player()),
            "failed_join" => Self::FailedJoin(player()),
            "player_leave" => Self::PlayerLeave(player()),
            "player_forfeit" => Self::PlayerForfeit(player()),
            "player_pause_receive" => Self::PlayerPauseReceive(player()),
            "player_resume_receive" => Self::PlayerResumeReceive(player()),
            "chat" => Self::Chat(chat()),
            "command" => Self::Command(chat()),
            "init_success" => Self::InitSuccess,
            "new_item" | "new_items" => Self::NewItem(ItemData {
                event_idx: raw.event_idx.or(fields.event_idx),
                item_id: raw.item_id.or(fields.item_id).unwrap_or(-1),
                item_name: fields.item_name.clone(),
                location: raw.location.or(fields.location).unwrap_or(-1),
                location_name: fields.location_name.clone(),
            }),
            _ => Self::Unknown {
                event_type,
                data: raw.event_data.clone(),
            },
        }
    }

    /// Wire name of this kind.
    pub fn name(&self) -> &str {
        match self {
            Self::SessionCreate => "session_create",
            Self::PlayerJoin(_) => "player_join",
            Self::FailedJoin(_) => "failed_join",
            Self::PlayerLeave(_) => "player_leave",
            Self::PlayerForfeit(_) => "player_forfeit",
            Self::PlayerPauseReceive(_) => "player_pause_receive",
            Self::PlayerResumeReceive(_) => "player_resume_receive",
            Self::Chat(_) => "chat",
            Self::Command(_) => "command",
            Self::NewItem(_) => "new_item",
            Self::InitSuccess => "init_success",
            Self::Unknown { event_type, .. } => event_type,
        }
    }
}

/// A normalized session event. Two events are the same event iff their
/// `(id, historical)` pairs match.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub timestamp_ms: i64,
    pub kind: EventKind,
    pub from_player: PlayerSlot,
    pub to_player: PlayerSlot,
    pub session_id: Option<String>,
    pub historical: bool,
}

impl Event {
    /// A client-synthesized chat line from the system, used to surface
    /// warnings and errors in the event stream.
    pub fn system_notice(message: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            id: EventId::local(),
            timestamp_ms,
            kind: EventKind::Chat(ChatData {
                message: message.into(),
                chat_type: Some("system".to_owned()),
            }),
            from_player: PlayerSlot::SERVER,
            to_player: PlayerSlot::SERVER,
            session_id: None,
            historical: false,
        }
    }

    pub fn key(&self) -> (EventId, bool) {
        (self.id.clone(), self.historical)
    }

    pub fn sequence(&self) -> Option<SequenceKey> {
        match &self.kind {
            EventKind::NewItem(item) => item.event_idx,
            _ => None,
        }
    }

    /// Delivery view of a `new_item` event. `None` for other kinds, for items
    /// without a sequence key, and for item ids that do not fit the device's
    /// one-byte item field.
    pub fn as_item_event(&self) -> Option<ItemEvent> {
        let EventKind::NewItem(item) = &self.kind else {
            return None;
        };
        Some(ItemEvent {
            id: self.id.clone(),
            sequence: item.event_idx?,
            item_id: u8::try_from(item.item_id).ok()?,
            item_name: item.item_name.clone(),
            from_player: self.from_player,
            to_player: self.to_player,
            location: item.location,
        })
    }
}

/// One pending delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemEvent {
    pub id: EventId,
    pub sequence: SequenceKey,
    pub item_id: u8,
    pub item_name: Option<String>,
    pub from_player: PlayerSlot,
    pub to_player: PlayerSlot,
    pub location: i64,
}
