// multiworld_client: synchronization engine for a multiworld relay session.
//
// Two loops are kept in step here: a WebSocket session with the relay
// (handshake, event stream, control messages, reconnects) and a delivery
// pipeline that writes received items into a running game's memory one at a
// time, in the relay's sequence order, through an abstract device channel.
//
// Module overview:
// - `config.rs`:      `ClientConfig` / `TimingConfig`, loaded from JSON with
//                     defaults; validation and the session socket URL.
// - `error.rs`:       Typed errors for the device, transport, directory,
//                     config, and handle boundaries.
// - `event_log.rs`:   Append-only event record, deduplicated by
//                     `(id, historical)`.
// - `item_queue.rs`:  Pending deliveries for the local player, sorted by
//                     sequence key; a projection over the log.
// - `state.rs`:       `SessionState` behind one async mutex, the handshake
//                     state machine, identity, and the receiving flag.
// - `device.rs`:      `DeviceChannel` seam, the memory map, and
//                     `MemoryDevice` for offline runs and tests.
// - `link.rs`:        `RelayConnector` / `RelayLink` seams and their
//                     tokio-tungstenite implementation.
// - `connection.rs`:  `ConnectionManager` (one socket, generations, pump
//                     task) and `dispatch()` of relay messages into state.
// - `identity.rs`:    Device sampling and the identity state machine that
//                     decides when to resolve, fall back, or reconnect.
// - `delivery.rs`:    `DeliveryLoop`: wait-ready, wait-consumed, ordered
//                     write, settle.
// - `directory.rs`:   HTTP history and roster lookups, forfeit.
// - `coordinator.rs`: `SessionCoordinator` event loop and `SessionHandle`.
//
// The `multiworld` binary (`main.rs`) is a line-oriented front end over a
// `SessionHandle`.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod delivery;
pub mod device;
pub mod directory;
pub mod error;
pub mod event_log;
pub mod identity;
pub mod item_queue;
pub mod link;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, TimingConfig};
pub use coordinator::{SessionCoordinator, SessionHandle, SessionStatus};
pub use device::{DeviceChannel, MemoryDevice, TimedDevice};
pub use directory::{ForfeitSummary, HttpDirectory, SessionDirectory, StaticDirectory};
pub use error::{ConfigError, DeviceError, DirectoryError, SessionError, TransportError};
pub use link::WsConnector;
