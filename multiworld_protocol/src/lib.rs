// multiworld_protocol: wire protocol for the multiworld item relay.
//
// This crate defines the message types, event normalization, and frame codec
// used between the sync client (`multiworld_client`) and the relay server.
// The relay speaks JSON text frames over a WebSocket; this crate knows
// nothing about sockets and has no async runtime dependency.
//
// Module overview:
// - `types.rs`:    Value types: `PlayerSlot`, `SequenceKey`, `EventId`.
// - `event.rs`:    `RawEvent` (wire shape, live or historical), `Event` and
//                  `EventKind` (normalized), `ItemEvent` (delivery view).
// - `message.rs`:  `ClientMessage` / `ServerMessage` enums and `PlayerInfo`.
// - `framing.rs`:  `{type, data}` envelope encode/decode with a size cap.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **JSON everywhere.** The relay is JSON-native; serde_json handles both
//   frames and the historical HTTP payloads.
// - **Lenient decoding.** Unknown frame and event types become explicit
//   `Unknown` variants instead of errors.
// - **Sequence keys are opaque pairs.** The relay assigns them; the client
//   only compares them and checks for `+1` succession.

pub mod error;
pub mod event;
pub mod framing;
pub mod message;
pub mod types;

pub use error::ProtocolError;
pub use event::{ChatData, Event, EventKind, ItemData, ItemEvent, PlayerData, RawEvent};
pub use framing::{
    Envelope, MAX_FRAME_SIZE, decode_client_frame, decode_server_frame, encode_client_frame,
    encode_server_frame,
};
pub use message::{ChatPayload, ClientMessage, MemorySnapshot, PlayerInfo, ServerMessage};
pub use types::{EventId, PlayerSlot, SequenceKey};
