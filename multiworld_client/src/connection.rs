// Relay connection management.
//
// `ConnectionManager` owns at most one relay socket. `connect()` dials the
// relay through a `RelayConnector`, sends the password as the first frame
// when one is configured, and spawns a pump task that shuttles frames
// between the link and two channels:
// - outbound: `send()` queues encoded frames; `close()` queues a close.
// - inbound: every frame and the final close are forwarded to the
//   coordinator as a `RelayEvent`, tagged with the socket's generation.
//
// Generations let the coordinator drop events from a socket it has already
// replaced: a forced reconnect bumps the generation before the old pump has
// necessarily finished, and its late close must not schedule a reconnect of
// the new socket.
//
// `dispatch()` applies one decoded `ServerMessage` to `SessionState` and
// reports what the coordinator needs to do next (send `player_info`, kick
// the delivery loop, clear the memory-sync wait). It is synchronous and
// never touches the socket, which keeps it directly testable.

use std::sync::Arc;

use chrono::Utc;
use multiworld_protocol::{
    ChatPayload, ClientMessage, Event, RawEvent, ServerMessage, encode_client_frame,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::link::{CloseInfo, LinkEvent, RelayConnector, RelayLink};
use crate::state::SessionState;

/// Close code for a client-initiated reconnect.
pub const RECONNECT_CLOSE_CODE: u16 = 4000;
/// Close code for a normal shutdown.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// An inbound link event from a specific socket generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEvent {
    pub generation: u64,
    pub event: LinkEvent,
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

struct OpenSocket {
    outbound: mpsc::UnboundedSender<Outbound>,
    _pump: JoinHandle<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn RelayConnector>,
    url: String,
    password: Option<String>,
    inbound: mpsc::UnboundedSender<RelayEvent>,
    socket: Option<OpenSocket>,
    generation: u64,
    player_info_sent: bool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        url: String,
        password: Option<String>,
        inbound: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        Self {
            connector,
            url,
            password,
            inbound,
            socket: None,
            generation: 0,
            player_info_sent: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|socket| !socket.outbound.is_closed())
    }

    /// Generation of the most recently opened socket.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.socket.is_some() && generation == self.generation
    }

    /// Open the relay socket. A no-op returning `Ok(false)` while one is
    /// already open.
    pub async fn connect(&mut self) -> Result<bool, TransportError> {
        if self.is_open() {
            debug!(generation = self.generation, "connect while open; ignoring");
            return Ok(false);
        }
        self.socket = None;

        let mut link = self.connector.open(&self.url).await?;
        if let Some(password) = &self.password {
            link.send_text(password.clone()).await?;
        }

        self.generation += 1;
        self.player_info_sent = false;
        let (outbound, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(link, rx, self.inbound.clone(), self.generation));
        self.socket = Some(OpenSocket {
            outbound,
            _pump: pump,
        });
        info!(url = %self.url, generation = self.generation, "connected to relay");
        Ok(true)
    }

    pub fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let text = encode_client_frame(message)?;
        socket
            .outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    pub fn player_info_sent(&self) -> bool {
        self.player_info_sent
    }

    pub fn mark_player_info_sent(&mut self) {
        self.player_info_sent = true;
    }

    /// Close the socket, if open. Events it still produces are stale.
    pub fn close(&mut self, code: u16, reason: &str) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.outbound.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
            info!(code, reason, generation = self.generation, "closing relay socket");
        }
    }

    /// The relay side closed socket `generation`. Returns whether it was the
    /// current one.
    pub fn on_closed(&mut self, generation: u64) -> bool {
        if self.is_current(generation) {
            self.socket = None;
            true
        } else {
            false
        }
    }
}

async fn pump(
    mut link: Box<dyn RelayLink>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<RelayEvent>,
    generation: u64,
) {
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = link.send_text(text).await {
                        warn!(error = %e, generation, "relay send failed");
                        let _ = inbound.send(RelayEvent {
                            generation,
                            event: LinkEvent::Closed(CloseInfo::transient()),
                        });
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    if let Err(e) = link.close(code, &reason).await {
                        debug!(error = %e, generation, "close handshake failed");
                    }
                    break;
                }
                None => {
                    let _ = link.close(NORMAL_CLOSE_CODE, "").await;
                    break;
                }
            },
            event = link.next_event() => {
                let closed = matches!(event, LinkEvent::Closed(_));
                if inbound.send(RelayEvent { generation, event }).is_err() || closed {
                    break;
                }
            }
        }
    }
    debug!(generation, "relay pump finished");
}

/// Follow-up work after dispatching one relay message.
#[derive(Debug, Default, PartialEq)]
pub struct Dispatch {
    /// Events newly appended to the log.
    pub logged: Vec<Event>,
    /// Items newly added to the delivery queue.
    pub queued: usize,
    /// Handshake state moved; `player_info` may now be due.
    pub handshake_advanced: bool,
    pub memory_acknowledged: bool,
}

impl Dispatch {
    fn log(&mut self, state: &mut SessionState, event: Event) {
        if state.events.append(event.clone()) {
            self.logged.push(event);
        }
    }
}

/// Apply one relay message to session state.
pub fn dispatch(message: ServerMessage, state: &mut SessionState) -> Dispatch {
    let mut out = Dispatch::default();
    match message {
        ServerMessage::ConnectionAccepted => {
            out.handshake_advanced = state.connection.on_accepted();
            debug!("relay accepted connection");
        }
        ServerMessage::PlayerInfoRequest => {
            out.handshake_advanced = state.connection.on_player_info_requested();
            debug!(state = ?state.connection, "relay requested player info");
        }
        ServerMessage::InitSuccess => info!("relay session initialized"),
        ServerMessage::PlayerJoin(raw)
        | ServerMessage::PlayerLeave(raw)
        | ServerMessage::PlayerPauseReceive(raw)
        | ServerMessage::PlayerResumeReceive(raw)
        | ServerMessage::PlayerForfeit(raw)
        | ServerMessage::SessionCreate(raw)
        | ServerMessage::Chat(ChatPayload::Event(raw)) => {
            out.log(state, raw.into_event(false));
        }
        ServerMessage::Chat(ChatPayload::Text(text)) => {
            out.log(state, Event::system_notice(text, Utc::now().timestamp_millis()));
        }
        ServerMessage::NewItems(raws) => dispatch_new_items(raws, state, &mut out),
        ServerMessage::SramUpdated => out.memory_acknowledged = true,
        ServerMessage::NonPlayerDetected { message } => {
            let text = message.unwrap_or_else(|| {
                "No compatible game detected; joined the session as a non-player".to_owned()
            });
            warn!(%text, "relay reports non-player");
            out.log(state, Event::system_notice(text, Utc::now().timestamp_millis()));
        }
        ServerMessage::Unknown { kind, .. } => {
            debug!(%kind, "ignoring unknown relay message");
        }
    }
    out
}

fn dispatch_new_items(raws: Vec<RawEvent>, state: &mut SessionState, out: &mut Dispatch) {
    let mut events: Vec<Event> = raws.into_iter().map(|raw| raw.into_event(false)).collect();
    events.sort_by_key(Event::sequence);

    let local = state.identity.player_id;
    for event in events {
        // Resends are offered again even when already logged; the queue and
        // the device cursor catch true duplicates.
        if let Some(item) = event.as_item_event() {
            if state.queue.offer(item, local) {
                out.queued += 1;
            }
        } else if event.to_player == local && event.from_player != local {
            warn!(id = %event.id, "item for us without a deliverable sequence key or item id");
        }
        out.log(state, event);
    }
    if out.queued > 0 {
        debug!(queued = out.queued, pending = state.queue.len(), "queued items");
    }
}
