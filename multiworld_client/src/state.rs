// Shared session state and the small state machines inside it.
//
// `SessionState` is the single place where the event log, the item queue,
// the resolved identity, and the connection handshake state live. It sits
// behind one `tokio::sync::Mutex` (`SharedState`), so every mutation is
// serialized: the coordinator holds it while dispatching relay frames, the
// delivery loop holds it while popping an item and while writing it.
//
// `epoch` increments on every forced reconnect. Long-running work (a
// delivery pass, a poll) captures the epoch when it starts and gives up as
// soon as it no longer matches.
//
// `ReceivingFlag` is an atomic outside the mutex; the device poller reads it
// without taking the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use multiworld_protocol::{MemorySnapshot, PlayerSlot, SequenceKey};
use tracing::debug;

use crate::event_log::EventLog;
use crate::item_queue::ItemQueue;

pub type SharedState = Arc<tokio::sync::Mutex<SessionState>>;

/// Relay handshake progress for the current socket.
///
/// `Disconnected -> Accepted -> AwaitingPlayerInfo -> Connected`, forward
/// only; `reset()` returns to `Disconnected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Accepted,
    AwaitingPlayerInfo,
    Connected,
}

impl ConnectionState {
    /// The relay accepted the transport.
    pub fn on_accepted(&mut self) -> bool {
        self.advance(Self::Disconnected, Self::Accepted)
    }

    /// The relay asked for `player_info`. A request on a socket we never saw
    /// accepted implies acceptance; the state still passes through it.
    pub fn on_player_info_requested(&mut self) -> bool {
        if *self == Self::Disconnected {
            debug!("player_info_request before connection_accepted");
            self.on_accepted();
        }
        self.advance(Self::Accepted, Self::AwaitingPlayerInfo)
    }

    /// Local identity resolved before the relay asked.
    pub fn on_identity_resolved(&mut self) -> bool {
        self.advance(Self::Accepted, Self::AwaitingPlayerInfo)
    }

    pub fn on_player_info_sent(&mut self) -> bool {
        self.advance(Self::AwaitingPlayerInfo, Self::Connected)
    }

    pub fn reset(&mut self) {
        *self = Self::Disconnected;
    }

    fn advance(&mut self, from: Self, to: Self) -> bool {
        if *self == from {
            *self = to;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerType {
    Player,
    NonPlayer,
}

/// Who this client is in the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub player_id: PlayerSlot,
    /// Signature of the loaded seed, for players.
    pub rom_name: Option<String>,
    pub player_type: PlayerType,
}

impl Default for PlayerIdentity {
    fn default() -> Self {
        Self::unresolved()
    }
}

impl PlayerIdentity {
    pub fn unresolved() -> Self {
        Self {
            player_id: PlayerSlot::UNKNOWN,
            rom_name: None,
            player_type: PlayerType::Player,
        }
    }

    pub fn player(player_id: PlayerSlot, rom_name: String) -> Self {
        Self {
            player_id,
            rom_name: Some(rom_name),
            player_type: PlayerType::Player,
        }
    }

    pub fn non_player() -> Self {
        Self {
            player_id: PlayerSlot::NON_PLAYER,
            rom_name: None,
            player_type: PlayerType::NonPlayer,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.player_id.is_unknown()
    }
}

/// Last known device condition, as seen by the poller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceStatus {
    #[default]
    Unknown,
    NoDevice,
    NotInGame(u8),
    InGame(u8),
}

/// Set while the delivery loop owns the device.
#[derive(Clone, Debug, Default)]
pub struct ReceivingFlag(Arc<AtomicBool>);

impl ReceivingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Claim the flag. `None` if someone already holds it.
    pub(crate) fn try_acquire(&self) -> Option<ReceivingGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReceivingGuard(self.0.clone()))
    }
}

/// Clears the receiving flag on drop.
#[derive(Debug)]
pub(crate) struct ReceivingGuard(Arc<AtomicBool>);

impl Drop for ReceivingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub events: EventLog,
    pub queue: ItemQueue,
    pub identity: PlayerIdentity,
    pub connection: ConnectionState,
    /// User asked not to receive items.
    pub paused: bool,
    pub epoch: u64,
    pub device: DeviceStatus,
    /// Last key the device reported taking.
    pub device_cursor: Option<SequenceKey>,
    pub last_snapshot: Option<(DateTime<Utc>, MemorySnapshot)>,
    /// Player names; slot `n` is index `n - 1`.
    pub roster: Vec<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the queue from the log for the current identity.
    pub fn rebuild_queue(&mut self) {
        self.queue = ItemQueue::project(&self.events, self.identity.player_id, self.device_cursor);
    }

    /// Forget everything tied to the previous socket and identity.
    pub fn reset_for_reconnect(&mut self) {
        self.identity = PlayerIdentity::unresolved();
        self.connection.reset();
        self.queue.clear();
        self.device_cursor = None;
        self.epoch += 1;
    }

    /// Display name for a slot.
    pub fn player_name(&self, slot: PlayerSlot) -> String {
        slot.roster_index()
            .and_then(|i| self.roster.get(i))
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("Player {}", slot.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_never_skips_awaiting() {
        let mut state = ConnectionState::default();
        assert!(!state.on_player_info_sent());
        assert!(!state.on_identity_resolved());
        assert!(state.on_accepted());
        assert!(!state.on_player_info_sent());
        assert!(state.on_identity_resolved());
        assert_eq!(state, ConnectionState::AwaitingPlayerInfo);
        // A late relay request changes nothing.
        assert!(!state.on_player_info_requested());
        assert!(state.on_player_info_sent());
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn request_without_accept_passes_through_accepted() {
        let mut state = ConnectionState::default();
        assert!(state.on_player_info_requested());
        assert_eq!(state, ConnectionState::AwaitingPlayerInfo);
    }

    #[test]
    fn receiving_flag_is_exclusive() {
        let flag = ReceivingFlag::new();
        let guard = flag.try_acquire().unwrap();
        assert!(flag.is_set());
        assert!(flag.try_acquire().is_none());
        drop(guard);
        assert!(!flag.is_set());
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn roster_names_fall_back() {
        let state = SessionState {
            roster: vec!["Link".into(), String::new()],
            ..SessionState::default()
        };
        assert_eq!(state.player_name(PlayerSlot(1)), "Link");
        assert_eq!(state.player_name(PlayerSlot(2)), "Player 2");
        assert_eq!(state.player_name(PlayerSlot(5)), "Player 5");
    }

    #[test]
    fn reconnect_reset_bumps_epoch() {
        let mut state = SessionState::new();
        state.identity = PlayerIdentity::player(PlayerSlot(2), "DR_x_2_1".into());
        state.connection = ConnectionState::Connected;
        state.paused = true;
        state.reset_for_reconnect();
        assert!(!state.identity.is_resolved());
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert_eq!(state.epoch, 1);
        assert!(state.paused);
    }
}
