// Core value types for the multiworld relay protocol.
//
// These are lightweight newtypes shared by `event.rs`, `message.rs`, and the
// client crate's queues. They mirror how the relay numbers things on the
// wire rather than inventing client-side identifiers:
// - `PlayerSlot`: signed slot number with reserved negative values for the
//   server and for non-player (spectator/bot) identities.
// - `SequenceKey`: the relay's per-recipient item counter, sent as a
//   two-byte `[hi, lo]` array and ordered as `hi * 256 + lo`.
// - `EventId`: relay-assigned numeric id, or a random token the client
//   assigns to events that arrive without one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A player slot as numbered by the relay. Slots `>= 1` are real players.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlayerSlot(pub i32);

impl PlayerSlot {
    /// The relay itself (system messages, admin sends).
    pub const SERVER: Self = Self(-1);
    /// A connected account with no compatible game loaded.
    pub const NON_PLAYER: Self = Self(-2);
    /// Not yet resolved.
    pub const UNKNOWN: Self = Self(0);

    pub fn is_player(self) -> bool {
        self.0 >= 1
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Zero-based index into the session roster, for player slots only.
    pub fn roster_index(self) -> Option<usize> {
        if self.is_player() {
            usize::try_from(self.0 - 1).ok()
        } else {
            None
        }
    }

    /// Sender byte written into the device's pending-item slot. Senders that
    /// are not a player slot (server, admin) are written as 0.
    pub fn as_device_byte(self) -> u8 {
        if self.is_player() {
            u8::try_from(self.0).unwrap_or(0)
        } else {
            0
        }
    }
}

impl fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SERVER => write!(f, "server"),
            Self::NON_PLAYER => write!(f, "non-player"),
            Self::UNKNOWN => write!(f, "unknown"),
            Self(n) => write!(f, "P{n}"),
        }
    }
}

/// Relay-assigned item sequence number for one recipient.
///
/// Derived `Ord` compares `hi` then `lo`, which is the same order as the
/// combined 16-bit value.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(from = "[u8; 2]", into = "[u8; 2]")]
pub struct SequenceKey {
    hi: u8,
    lo: u8,
}

impl SequenceKey {
    pub const ZERO: Self = Self { hi: 0, lo: 0 };

    pub const fn new(hi: u8, lo: u8) -> Self {
        Self { hi, lo }
    }

    pub const fn from_value(value: u16) -> Self {
        let [hi, lo] = value.to_be_bytes();
        Self { hi, lo }
    }

    pub const fn value(self) -> u16 {
        u16::from_be_bytes([self.hi, self.lo])
    }

    pub const fn hi(self) -> u8 {
        self.hi
    }

    pub const fn lo(self) -> u8 {
        self.lo
    }

    /// The key that must follow this one. `None` once the counter is exhausted.
    pub fn next(self) -> Option<Self> {
        self.value().checked_add(1).map(Self::from_value)
    }
}

impl From<[u8; 2]> for SequenceKey {
    fn from([hi, lo]: [u8; 2]) -> Self {
        Self { hi, lo }
    }
}

impl From<SequenceKey> for [u8; 2] {
    fn from(key: SequenceKey) -> Self {
        [key.hi, key.lo]
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({},{})", self.value(), self.hi, self.lo)
    }
}

/// Identifier of a session event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventId {
    /// Assigned by the relay's database.
    Relay(i64),
    /// Assigned locally to an event that arrived without an id, so that it
    /// never collides with relay-assigned numbers.
    Local(String),
}

impl EventId {
    /// Fresh random local id.
    pub fn local() -> Self {
        Self::Local(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay(id) => write!(f, "{id}"),
            Self::Local(token) => write!(f, "local:{token}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_key_orders_by_combined_value() {
        let a = SequenceKey::new(0, 255);
        let b = SequenceKey::new(1, 0);
        assert!(a < b);
        assert_eq!(a.next(), Some(b));
        assert_eq!(b.value(), 256);
        assert_eq!(SequenceKey::from_value(0xFFFF).next(), None);
    }

    #[test]
    fn sequence_key_wire_form_is_a_pair() {
        let key: SequenceKey = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(key, SequenceKey::new(1, 2));
        assert_eq!(serde_json::to_string(&key).unwrap(), "[1,2]");
    }

    #[test]
    fn player_slot_device_byte() {
        assert_eq!(PlayerSlot(3).as_device_byte(), 3);
        assert_eq!(PlayerSlot::SERVER.as_device_byte(), 0);
        assert_eq!(PlayerSlot::NON_PLAYER.roster_index(), None);
        assert_eq!(PlayerSlot(1).roster_index(), Some(0));
    }

    #[test]
    fn event_ids_are_untagged_on_the_wire() {
        let relay: EventId = serde_json::from_str("42").unwrap();
        assert_eq!(relay, EventId::Relay(42));
        assert_ne!(EventId::local(), EventId::local());
    }
}
