// Error types for the sync engine.
//
// Each external resource gets its own enum so callers can tell a dead device
// from a dead socket without string matching:
// - `DeviceError`:    the device channel (no device, timeouts, short reads).
// - `TransportError`: the relay WebSocket.
// - `DirectoryError`: the HTTP session directory (history, roster, forfeit).
// - `ConfigError`:    loading and validating `ClientConfig`.
// - `SessionError`:   the only error the `SessionHandle` API returns.
//
// None of these reach a user directly. The coordinator turns them into state
// changes or system chat events.

use std::path::PathBuf;
use std::time::Duration;

use multiworld_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device is attached to the channel.
    #[error("no device")]
    NoDevice,
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("short read at {address:#08x}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        address: u32,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not reach relay at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("timed out connecting to {url}")]
    ConnectTimeout { url: String },
    #[error("relay link is closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("session {0} not found")]
    NotFound(String),
    /// The relay answered but refused the request.
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no session id configured")]
    MissingSession,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session has shut down")]
    Closed,
}
