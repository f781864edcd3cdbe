// Test-only relay double for multiworld client integration tests.
//
// `TestRelay` is a real WebSocket server on 127.0.0.1 (random port) speaking
// the relay's side of the session protocol closely enough to drive the real
// client end to end:
// - optional password check on the first frame, closing with
//   "Invalid password" on a mismatch;
// - `connection_accepted` then `player_info_request` on every accepted
//   socket;
// - every frame the client sends is recorded per connection, along with the
//   close code the client used, if any;
// - tests push arbitrary `ServerMessage`s to the newest connection or close
//   it with a reason.
//
// Nothing here knows about item ordering or delivery; assertions about
// those go through the client's `MemoryDevice` and `wait_for_status`.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use multiworld_client::{SessionHandle, SessionStatus};
use multiworld_protocol::{
    ClientMessage, PlayerInfo, RawEvent, ServerMessage, decode_client_frame, encode_server_frame,
};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Default timeout for `wait_for`.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between `wait_for` checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Outbound {
    Frame(String),
    Close(String),
}

/// Everything seen on one accepted socket.
#[derive(Clone, Debug, Default)]
pub struct ConnectionLog {
    /// Raw text frames from the client, in order (password included).
    pub frames: Vec<String>,
    /// Close code and reason the client sent, if it closed first.
    pub client_close: Option<(u16, String)>,
    pub open: bool,
}

impl ConnectionLog {
    /// Frames that decode as client messages.
    pub fn messages(&self) -> Vec<ClientMessage> {
        self.frames
            .iter()
            .filter_map(|f| decode_client_frame(f).ok())
            .collect()
    }

    pub fn player_infos(&self) -> Vec<PlayerInfo> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::PlayerInfo(info) => Some(info),
                _ => None,
            })
            .collect()
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    log: ConnectionLog,
}

#[derive(Default)]
struct Shared {
    connections: Mutex<Vec<Connection>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A relay double listening on localhost.
pub struct TestRelay {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl TestRelay {
    /// Start listening. With `password`, the first client frame must match.
    pub async fn start(password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test relay");
        let addr = listener.local_addr().expect("test relay address");
        let shared = Arc::new(Shared::default());
        let password = password.map(str::to_owned);

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_shared.clone(), password.clone()));
            }
        });
        Self {
            addr,
            shared,
            accept_task,
        }
    }

    /// Base URL for `ClientConfig::relay_url`.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of sockets accepted so far.
    pub fn connection_count(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn connection(&self, index: usize) -> ConnectionLog {
        self.shared.lock()[index].log.clone()
    }

    /// Push a message on the newest connection.
    pub fn send(&self, message: &ServerMessage) {
        let text = encode_server_frame(message).expect("encode server frame");
        if let Some(connection) = self.shared.lock().last() {
            let _ = connection.outbound.send(Outbound::Frame(text));
        }
    }

    /// Close the newest connection with `reason`.
    pub fn close_latest(&self, reason: &str) {
        if let Some(connection) = self.shared.lock().last() {
            let _ = connection.outbound.send(Outbound::Close(reason.to_owned()));
        }
    }

    /// Poll `check` against this relay until it holds.
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        wait_until(what, || check(self)).await;
    }
}

/// Poll `check` until it holds; panics after `POLL_TIMEOUT`.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll the session status until `check` holds; returns that status.
pub async fn wait_for_status(
    handle: &SessionHandle,
    what: &str,
    check: impl Fn(&SessionStatus) -> bool,
) -> SessionStatus {
    let start = Instant::now();
    loop {
        let status = handle.status().await.expect("session is running");
        if check(&status) {
            return status;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>, password: Option<String>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let index = {
        let mut connections = shared.lock();
        connections.push(Connection {
            outbound: tx,
            log: ConnectionLog {
                open: true,
                ..ConnectionLog::default()
            },
        });
        connections.len() - 1
    };
    let record = |update: &dyn Fn(&mut ConnectionLog)| update(&mut shared.lock()[index].log);

    if let Some(password) = password {
        let first = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break Some(text.to_string()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                _ => break None,
            }
        };
        if let Some(first) = &first {
            record(&|log| log.frames.push(first.clone()));
        }
        if first.as_deref() != Some(password.as_str()) {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "Invalid password".into(),
                }))
                .await;
            record(&|log| log.open = false);
            return;
        }
    }

    for hello in [ServerMessage::ConnectionAccepted, ServerMessage::PlayerInfoRequest] {
        let text = encode_server_frame(&hello).expect("encode handshake");
        if ws.send(Message::text(text)).await.is_err() {
            record(&|log| log.open = false);
            return;
        }
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(text)) => {
                    if ws.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.into(),
                        }))
                        .await;
                    break;
                }
                None => break,
            },
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    record(&|log| log.frames.push(text.clone()));
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        let close = (u16::from(frame.code), frame.reason.to_string());
                        record(&|log| log.client_close = Some(close.clone()));
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
    record(&|log| log.open = false);
}

/// A live `new_item` row for `to_player`, keyed `(0, idx)`.
pub fn item(id: i64, idx: u8, item_id: i64, from_player: i32, to_player: i32) -> RawEvent {
    serde_json::from_value(json!({
        "id": id,
        "timestamp": 1_700_000_000 + id,
        "event_type": "new_item",
        "from_player": from_player,
        "to_player": to_player,
        "event_data": {
            "item_id": item_id,
            "item_name": format!("Item {item_id}"),
            "location": 1000 + id,
            "event_idx": [0, idx],
        },
    }))
    .expect("valid item row")
}

/// `new_items` frame carrying `items` in the given order.
pub fn new_items(items: Vec<RawEvent>) -> ServerMessage {
    ServerMessage::NewItems(items)
}
