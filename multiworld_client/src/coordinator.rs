// Session coordinator: the event loop that wires the sync engine together.
//
// Architecture: one task owns everything mutable that is not in
// `SessionState` (the socket manager, the identity monitor, timers) and
// reacts to four sources in a `tokio::select!` loop:
// - **Commands** from `SessionHandle` (pause, chat, reconnect, forfeit,
//   status...).
// - **Relay events**: frames and closes from the connection pump, tagged
//   with their socket generation.
// - **Internal events** from the short-lived tasks the loop spawns: a device
//   sample finished, a delivery pass finished, a reconnect delay elapsed,
//   history arrived, a forfeit was answered.
// - **The poll ticker** (`poll_interval_ms`), which starts a device sample.
//
// Device access is serialized here: a sample is never started while a
// delivery pass runs or the receiving flag is set, and a delivery pass is
// never started while a sample is in flight. Either side finishing re-checks
// whether the other is due. A pass is not started while the head of the
// queue is ahead of `device_cursor + 1`; after a pass that deferred such an
// item the queue is re-projected from the event log.
//
// Errors never cross the handle. Transport and device failures become state
// changes (`DeviceStatus`, `ConnectionState`) plus, where the user should
// see them, a system chat event in the log and on the broadcast stream. The
// only error a handle returns is `SessionError::Closed` once this task has
// exited.
//
// Close handling: a relay close with a non-empty reason is terminal (the
// session stays down until `connect()` is called); an empty reason or a
// failed dial schedules a reconnect after `reconnect_delay_ms`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use multiworld_protocol::{
    ClientMessage, Event, MemorySnapshot, PlayerInfo, RawEvent, SequenceKey, ServerMessage,
    decode_server_frame,
};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{
    ConnectionManager, NORMAL_CLOSE_CODE, RECONNECT_CLOSE_CODE, RelayEvent, dispatch,
};
use crate::delivery::{DeliveryLoop, DeliveryOutcome, StopReason};
use crate::device::{DeviceChannel, snapshot_regions};
use crate::directory::{ForfeitSummary, SessionDirectory};
use crate::error::{DirectoryError, SessionError};
use crate::identity::{DeviceSampler, IdentityChange, IdentityMonitor, Sample};
use crate::link::{CloseInfo, LinkEvent, RelayConnector};
use crate::state::{
    ConnectionState, DeviceStatus, PlayerIdentity, PlayerType, ReceivingFlag, SessionState,
    SharedState,
};

const EVENT_STREAM_CAPACITY: usize = 256;

/// Point-in-time view of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub socket_open: bool,
    /// Reason of the terminal close, until the next `connect()`.
    pub terminated: Option<String>,
    pub identity: PlayerIdentity,
    pub queue_len: usize,
    pub paused: bool,
    pub receiving: bool,
    pub device: DeviceStatus,
    pub device_cursor: Option<SequenceKey>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub events_logged: usize,
}

#[derive(Debug)]
enum Command {
    Connect,
    SetPaused(bool),
    Chat(String),
    Reconnect(String),
    Forfeit,
    Status(oneshot::Sender<SessionStatus>),
    Shutdown,
}

/// Results reported back by tasks the coordinator spawned.
enum InternalEvent {
    Sampled {
        epoch: u64,
        sample: Sample,
    },
    DeliveryFinished(DeliveryOutcome),
    ReconnectDue {
        generation: u64,
    },
    HistoryLoaded {
        events: Result<Vec<RawEvent>, DirectoryError>,
        roster: Result<Vec<String>, DirectoryError>,
    },
    ForfeitAnswered(Result<ForfeitSummary, DirectoryError>),
}

/// Cloneable control surface for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
    receiving: ReceivingFlag,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    /// Open the relay socket if it is not open. Clears a terminal close.
    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(Command::Connect)
    }

    pub fn pause_receiving(&self) -> Result<(), SessionError> {
        self.send(Command::SetPaused(true))
    }

    pub fn resume_receiving(&self) -> Result<(), SessionError> {
        self.send(Command::SetPaused(false))
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Chat(text.into()))
    }

    /// Drop the socket and identity and start over.
    pub fn reconnect(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Reconnect(reason.into()))
    }

    /// Give up for the local player. The outcome arrives as a system notice.
    pub fn forfeit(&self) -> Result<(), SessionError> {
        self.send(Command::Forfeit)
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stream of events as they are logged, including system notices.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.is_set()
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown)
    }
}

pub struct SessionCoordinator {
    config: ClientConfig,
    state: SharedState,
    connection: ConnectionManager,
    monitor: IdentityMonitor,
    sampler: DeviceSampler,
    delivery: Arc<DeliveryLoop>,
    directory: Arc<dyn SessionDirectory>,
    receiving: ReceivingFlag,
    events: broadcast::Sender<Event>,
    commands: mpsc::UnboundedReceiver<Command>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    poll_task: Option<JoinHandle<()>>,
    delivery_running: bool,
    /// A delivery was asked for while the device was busy.
    redeliver: bool,
    /// When the last unacknowledged `update_memory` went out.
    memory_sync_since: Option<Instant>,
    terminated: Option<String>,
    /// A dial failure was already surfaced for the current outage.
    outage_reported: bool,
}

impl SessionCoordinator {
    /// Start a session task. It connects immediately.
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn RelayConnector>,
        device: Arc<dyn DeviceChannel>,
        directory: Arc<dyn SessionDirectory>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        let receiving = ReceivingFlag::new();
        let state: SharedState = Arc::new(Mutex::new(SessionState::new()));

        let connection = ConnectionManager::new(
            connector,
            config.socket_url(),
            config.password.clone(),
            relay_tx,
        );
        let sampler = DeviceSampler::new(
            device.clone(),
            receiving.clone(),
            config.compatible_prefixes.clone(),
            snapshot_regions(config.skip_pots, config.skip_sprites),
            config.timing.device_timeout(),
        );
        let delivery = Arc::new(DeliveryLoop::new(
            device,
            state.clone(),
            receiving.clone(),
            config.timing,
        ));

        let handle = SessionHandle {
            commands: command_tx,
            events: events.clone(),
            receiving: receiving.clone(),
        };
        let coordinator = Self {
            config,
            state,
            connection,
            monitor: IdentityMonitor::new(),
            sampler,
            delivery,
            directory,
            receiving,
            events,
            commands,
            relay_rx,
            internal_tx,
            internal_rx,
            poll_task: None,
            delivery_running: false,
            redeliver: false,
            memory_sync_since: None,
            terminated: None,
            outage_reported: false,
        };
        (handle, tokio::spawn(coordinator.run()))
    }

    async fn run(mut self) {
        info!(session = %self.config.session_id, "session starting");
        self.connect().await;

        let mut ticker = tokio::time::interval(self.config.timing.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.relay_rx.recv() => self.handle_relay(event).await,
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                _ = ticker.tick() => self.start_poll().await,
            }
        }

        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.connection.close(NORMAL_CLOSE_CODE, "client shutting down");
        info!(session = %self.config.session_id, "session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.terminated = None;
                self.connect().await;
            }
            Command::SetPaused(paused) => self.set_paused(paused).await,
            Command::Chat(text) => self.send_chat(text).await,
            Command::Reconnect(reason) => self.force_reconnect(&reason).await,
            Command::Forfeit => self.forfeit().await,
            Command::Status(reply) => {
                let _ = reply.send(self.status().await);
            }
            Command::Shutdown => {}
        }
    }

    async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            connection: state.connection,
            socket_open: self.connection.is_open(),
            terminated: self.terminated.clone(),
            identity: state.identity.clone(),
            queue_len: state.queue.len(),
            paused: state.paused,
            receiving: self.receiving.is_set(),
            device: state.device,
            device_cursor: state.device_cursor,
            last_snapshot_at: state.last_snapshot.as_ref().map(|(at, _)| *at),
            events_logged: state.events.len(),
        }
    }

    // -----------------------------------------------------------------
    // Relay socket
    // -----------------------------------------------------------------

    async fn connect(&mut self) {
        if self.terminated.is_some() {
            return;
        }
        match self.connection.connect().await {
            Ok(true) => {
                self.outage_reported = false;
                self.memory_sync_since = None;
                self.load_history();
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "could not reach relay");
                if !self.outage_reported {
                    self.outage_reported = true;
                    self.notify(format!("Could not connect to relay: {e}")).await;
                }
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&self) {
        let generation = self.connection.generation();
        let delay = self.config.timing.reconnect_delay();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(InternalEvent::ReconnectDue { generation });
        });
    }

    async fn handle_relay(&mut self, RelayEvent { generation, event }: RelayEvent) {
        if !self.connection.is_current(generation) {
            debug!(generation, "dropping event from a replaced socket");
            return;
        }
        match event {
            LinkEvent::Frame(text) => match decode_server_frame(&text) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => warn!(error = %e, "undecodable relay frame"),
            },
            LinkEvent::Closed(info) => self.handle_close(generation, info).await,
        }
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        let outcome = {
            let mut state = self.state.lock().await;
            dispatch(message, &mut state)
        };
        for event in outcome.logged {
            let _ = self.events.send(event);
        }
        if outcome.memory_acknowledged {
            self.memory_sync_since = None;
        }
        if outcome.handshake_advanced {
            self.maybe_send_player_info().await;
        }
        if outcome.queued > 0 {
            self.trigger_delivery().await;
        }
    }

    async fn handle_close(&mut self, generation: u64, info: CloseInfo) {
        self.connection.on_closed(generation);
        self.state.lock().await.connection.reset();
        self.memory_sync_since = None;

        if info.is_terminal() {
            error!(reason = %info.reason, code = ?info.code, "relay ended the session");
            self.notify(format!("Disconnected from relay: {}", info.reason))
                .await;
            self.terminated = Some(info.reason);
        } else {
            info!(code = ?info.code, "relay connection lost; reconnecting");
            self.schedule_reconnect();
        }
    }

    /// Send `player_info` if identity is known, the relay has accepted this
    /// socket, and it has not gone out on this socket yet.
    async fn maybe_send_player_info(&mut self) {
        if !self.connection.is_open() || self.connection.player_info_sent() {
            return;
        }
        let mut state = self.state.lock().await;
        if !state.identity.is_resolved() {
            return;
        }
        state.connection.on_identity_resolved();
        if state.connection != ConnectionState::AwaitingPlayerInfo {
            return;
        }

        let identity = state.identity.clone();
        let info = match identity.player_type {
            PlayerType::Player => PlayerInfo {
                player_id: identity.player_id,
                player_name: state.player_name(identity.player_id),
                rom_name: identity.rom_name.clone(),
                session_token: None,
                user_id: self.config.user_id,
            },
            PlayerType::NonPlayer => PlayerInfo {
                player_id: identity.player_id,
                player_name: self
                    .config
                    .user_id
                    .map_or_else(|| "Spectator".to_owned(), |id| format!("User {id}")),
                rom_name: None,
                session_token: self.config.session_token.clone(),
                user_id: self.config.user_id,
            },
        };
        let player_name = info.player_name.clone();
        if let Err(e) = self.connection.send(&ClientMessage::PlayerInfo(info)) {
            warn!(error = %e, "could not send player info");
            return;
        }
        self.connection.mark_player_info_sent();
        state.connection.on_player_info_sent();
        info!(player = %identity.player_id, name = %player_name, "sent player info");

        // The relay only learns about a pause made before the handshake now.
        if state.paused && self.connection.send(&ClientMessage::PauseReceiving).is_err() {
            warn!("could not restore paused state on the relay");
        }
    }

    /// Send a message that is only valid after the handshake.
    async fn send_when_connected(&mut self, message: &ClientMessage) -> bool {
        if self.state.lock().await.connection != ConnectionState::Connected {
            return false;
        }
        match self.connection.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "relay send failed");
                false
            }
        }
    }

    async fn force_reconnect(&mut self, reason: &str) {
        info!(%reason, "forcing reconnect");
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        // Waits for an in-flight device write to finish.
        self.state.lock().await.reset_for_reconnect();
        self.monitor.reset();
        self.memory_sync_since = None;
        self.terminated = None;
        self.connection.close(RECONNECT_CLOSE_CODE, reason);
        self.connect().await;
    }

    // -----------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------

    async fn set_paused(&mut self, paused: bool) {
        {
            let mut state = self.state.lock().await;
            if state.paused == paused {
                debug!(paused, "receiving state unchanged");
                return;
            }
            state.paused = paused;
        }
        info!(paused, "receiving toggled");
        let message = if paused {
            ClientMessage::PauseReceiving
        } else {
            ClientMessage::ResumeReceiving
        };
        // Before the handshake completes the relay is told in
        // `maybe_send_player_info`.
        self.send_when_connected(&message).await;
        if !paused {
            self.trigger_delivery().await;
        }
    }

    async fn send_chat(&mut self, text: String) {
        let text = text.trim().to_owned();
        if text.is_empty() {
            return;
        }
        if !self
            .send_when_connected(&ClientMessage::Chat { data: text })
            .await
        {
            self.notify("Not connected; message not sent").await;
        }
    }

    async fn forfeit(&mut self) {
        let player = {
            let state = self.state.lock().await;
            let identity = &state.identity;
            (identity.player_type == PlayerType::Player && identity.player_id.is_player())
                .then_some(identity.player_id)
        };
        let Some(player) = player else {
            self.notify("Only a player with a loaded game can forfeit").await;
            return;
        };
        info!(%player, "forfeiting");
        let directory = self.directory.clone();
        let session_id = self.config.session_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let answer = directory.forfeit(&session_id, player).await;
            let _ = tx.send(InternalEvent::ForfeitAnswered(answer));
        });
    }

    // -----------------------------------------------------------------
    // Device polling and delivery
    // -----------------------------------------------------------------

    async fn start_poll(&mut self) {
        if self.poll_task.is_some() || self.delivery_running || self.receiving.is_set() {
            return;
        }
        let epoch = self.state.lock().await.epoch;
        let sampler = self.sampler.clone();
        let tx = self.internal_tx.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let sample = sampler.sample().await;
            let _ = tx.send(InternalEvent::Sampled { epoch, sample });
        }));
    }

    async fn trigger_delivery(&mut self) {
        if self.delivery_running || self.poll_task.is_some() {
            self.redeliver = true;
            return;
        }
        {
            let state = self.state.lock().await;
            if state.paused || state.queue.is_empty() || !state.identity.player_id.is_player() {
                return;
            }
            if let (Some(head), Some(cursor)) = (state.queue.peek(), state.device_cursor) {
                if Some(head.sequence) > cursor.next() {
                    debug!(head = %head.sequence, %cursor, "waiting for earlier keys");
                    return;
                }
            }
        }
        self.redeliver = false;
        self.delivery_running = true;
        let delivery = self.delivery.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = delivery.deliver_pending().await;
            let _ = tx.send(InternalEvent::DeliveryFinished(outcome));
        });
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Sampled { epoch, sample } => {
                self.poll_task = None;
                let redeliver = std::mem::take(&mut self.redeliver);
                if epoch != self.state.lock().await.epoch {
                    debug!("discarding sample from before a reconnect");
                    return;
                }
                self.apply_sample(sample).await;
                if redeliver && !self.delivery_running {
                    self.trigger_delivery().await;
                }
            }
            InternalEvent::DeliveryFinished(outcome) => {
                self.delivery_running = false;
                let DeliveryOutcome::Ran(report) = outcome else {
                    return;
                };
                if let StopReason::Device(reason) = &report.stop {
                    self.state.lock().await.device = DeviceStatus::NoDevice;
                    warn!(%reason, "device lost during delivery");
                }
                if report.deferred > 0 && report.stop != StopReason::Superseded {
                    let mut state = self.state.lock().await;
                    state.rebuild_queue();
                    debug!(pending = state.queue.len(), "re-projected queue after deferral");
                }
                // Items may have arrived during the pass or the drain settle.
                if report.stop == StopReason::Drained && (report.written > 0 || self.redeliver) {
                    self.trigger_delivery().await;
                }
            }
            InternalEvent::ReconnectDue { generation } => {
                if generation == self.connection.generation()
                    && !self.connection.is_open()
                    && self.terminated.is_none()
                {
                    self.connect().await;
                }
            }
            InternalEvent::HistoryLoaded { events, roster } => {
                self.apply_history(events, roster).await;
            }
            InternalEvent::ForfeitAnswered(Ok(summary)) => {
                info!(?summary, "forfeit accepted");
                self.notify(format!(
                    "Forfeited; {} remaining items released to their owners",
                    summary.forfeit_item_count
                ))
                .await;
            }
            InternalEvent::ForfeitAnswered(Err(e)) => {
                warn!(error = %e, "forfeit failed");
                self.notify(format!("Forfeit failed: {e}")).await;
            }
        }
    }

    async fn apply_sample(&mut self, sample: Sample) {
        let (identity, may_join_as_non_player) = {
            let state = self.state.lock().await;
            (state.identity.clone(), self.config.user_id.is_some())
        };
        let Some(decision) = self
            .monitor
            .observe(sample, &identity, may_join_as_non_player)
        else {
            return;
        };

        {
            let mut state = self.state.lock().await;
            state.device = decision.device;
            if decision.cursor.is_some() {
                state.device_cursor = decision.cursor;
            }
            if let Some(snapshot) = &decision.snapshot {
                state.last_snapshot = Some((Utc::now(), snapshot.clone()));
            }
        }

        if decision.save_and_quit {
            let was_paused = std::mem::replace(&mut self.state.lock().await.paused, false);
            if was_paused {
                info!("left the game; clearing stale pause");
                self.send_when_connected(&ClientMessage::ResumeReceiving)
                    .await;
            }
        }

        match decision.identity {
            IdentityChange::None => {}
            IdentityChange::Resolved(identity) => {
                {
                    let mut state = self.state.lock().await;
                    state.identity = identity;
                    state.rebuild_queue();
                }
                self.maybe_send_player_info().await;
            }
            IdentityChange::NonPlayer => {
                {
                    let mut state = self.state.lock().await;
                    state.identity = PlayerIdentity::non_player();
                    state.queue.clear();
                }
                info!("no compatible game loaded; joining as a non-player");
                self.maybe_send_player_info().await;
            }
            IdentityChange::Changed { previous } => {
                self.notify(format!(
                    "Loaded game changed (was {previous}); reconnecting"
                ))
                .await;
                self.force_reconnect("loaded game changed").await;
                return;
            }
        }

        if let Some(snapshot) = decision.snapshot {
            self.push_memory(snapshot).await;
        }
        if matches!(decision.device, DeviceStatus::InGame(_)) {
            self.trigger_delivery().await;
        }
    }

    async fn push_memory(&mut self, snapshot: MemorySnapshot) {
        if self.delivery_running || self.receiving.is_set() {
            return;
        }
        if let Some(since) = self.memory_sync_since {
            if since.elapsed() < self.config.timing.memory_sync_timeout() {
                debug!("previous memory sync not yet acknowledged");
                return;
            }
            warn!("memory sync acknowledgement timed out");
            self.memory_sync_since = None;
        }
        if self
            .send_when_connected(&ClientMessage::UpdateMemory { data: snapshot })
            .await
        {
            self.memory_sync_since = Some(Instant::now());
        }
    }

    // -----------------------------------------------------------------
    // History and notices
    // -----------------------------------------------------------------

    fn load_history(&self) {
        let directory = self.directory.clone();
        let session_id = self.config.session_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let events = directory.fetch_events(&session_id).await;
            let roster = directory.fetch_roster(&session_id).await;
            let _ = tx.send(InternalEvent::HistoryLoaded { events, roster });
        });
    }

    async fn apply_history(
        &mut self,
        events: Result<Vec<RawEvent>, DirectoryError>,
        roster: Result<Vec<String>, DirectoryError>,
    ) {
        let mut added = Vec::new();
        {
            let mut state = self.state.lock().await;
            match roster {
                Ok(names) => state.roster = names,
                Err(e) => warn!(error = %e, "player roster unavailable"),
            }
            if let Ok(raws) = &events {
                for raw in raws {
                    let event = raw.clone().into_event(true);
                    if state.events.append(event.clone()) {
                        added.push(event);
                    }
                }
                if state.identity.player_id.is_player() {
                    state.rebuild_queue();
                }
            }
        }

        match events {
            Ok(_) => info!(loaded = added.len(), "session history loaded"),
            Err(e) => {
                warn!(error = %e, "session history unavailable");
                self.notify(format!("Could not load session history: {e}"))
                    .await;
            }
        }
        for event in added {
            let _ = self.events.send(event);
        }
        self.trigger_delivery().await;
    }

    /// Log a system notice and publish it.
    async fn notify(&self, message: impl Into<String>) {
        let event = Event::system_notice(message, Utc::now().timestamp_millis());
        self.state.lock().await.events.append(event.clone());
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use multiworld_protocol::{ClientMessage, EventKind, PlayerSlot};
    use serde_json::json;

    use super::*;
    use crate::device::MemoryDevice;
    use crate::directory::StaticDirectory;
    use crate::testing::ChannelConnector;

    fn config() -> ClientConfig {
        ClientConfig {
            session_id: "s1".into(),
            ..ClientConfig::default()
        }
    }

    async fn settle_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    fn roster() -> StaticDirectory {
        StaticDirectory {
            roster: vec!["Link".into(), "Zelda".into()],
            ..StaticDirectory::default()
        }
    }

    fn start(
        device: Arc<MemoryDevice>,
    ) -> (Arc<ChannelConnector>, SessionHandle, JoinHandle<()>) {
        start_with(device, roster())
    }

    fn start_with(
        device: Arc<MemoryDevice>,
        directory: StaticDirectory,
    ) -> (Arc<ChannelConnector>, SessionHandle, JoinHandle<()>) {
        let connector = Arc::new(ChannelConnector::default());
        let (handle, task) =
            SessionCoordinator::spawn(config(), connector.clone(), device, Arc::new(directory));
        (connector, handle, task)
    }

    async fn handshake(connector: &ChannelConnector) {
        settle_until(|| connector.opened() == 1).await;
        connector.push(&ServerMessage::ConnectionAccepted);
        connector.push(&ServerMessage::PlayerInfoRequest);
        settle_until(|| !player_infos(connector).is_empty()).await;
    }

    fn item_for_two(id: i64, idx: u8) -> RawEvent {
        serde_json::from_value(json!({
            "id": id,
            "timestamp": 1_700_000_000,
            "event_type": "new_item",
            "from_player": 1,
            "to_player": 2,
            "event_data": {"item_id": 10 + id, "location": id, "event_idx": [0, idx]},
        }))
        .unwrap()
    }

    /// Next system notice whose text contains `needle`.
    async fn notice_containing(events: &mut broadcast::Receiver<Event>, needle: &str) -> String {
        loop {
            let event = events.recv().await.unwrap();
            if let EventKind::Chat(chat) = &event.kind {
                if event.from_player == PlayerSlot::SERVER && chat.message.contains(needle) {
                    return chat.message.clone();
                }
            }
        }
    }

    fn player_infos(connector: &ChannelConnector) -> Vec<(usize, PlayerInfo)> {
        connector
            .messages()
            .into_iter()
            .filter_map(|(conn, m)| match m {
                ClientMessage::PlayerInfo(info) => Some((conn, info)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn player_info_goes_out_once_per_socket() {
        let device = Arc::new(MemoryDevice::with_signature("DR_abc_2_1"));
        let (connector, handle, _task) = start(device);
        settle_until(|| connector.opened() == 1).await;
        connector.push(&ServerMessage::ConnectionAccepted);
        connector.push(&ServerMessage::PlayerInfoRequest);

        settle_until(|| !player_infos(&connector).is_empty()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let infos = player_infos(&connector);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].1.player_id, PlayerSlot(2));
        assert_eq!(infos[0].1.player_name, "Zelda");
        assert_eq!(infos[0].1.rom_name.as_deref(), Some("DR_abc_2_1"));

        let status = handle.status().await.unwrap();
        assert_eq!(status.connection, ConnectionState::Connected);
        assert_eq!(status.device, DeviceStatus::InGame(0x07));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_sent_only_on_change() {
        let device = Arc::new(MemoryDevice::with_signature("DR_abc_2_1"));
        let (connector, handle, _task) = start(device);
        settle_until(|| connector.opened() == 1).await;
        connector.push(&ServerMessage::ConnectionAccepted);
        connector.push(&ServerMessage::PlayerInfoRequest);
        settle_until(|| !player_infos(&connector).is_empty()).await;

        handle.pause_receiving().unwrap();
        handle.pause_receiving().unwrap();
        handle.resume_receiving().unwrap();
        assert!(!handle.status().await.unwrap().paused);

        let toggles: Vec<_> = connector
            .messages()
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| {
                matches!(
                    m,
                    ClientMessage::PauseReceiving | ClientMessage::ResumeReceiving
                )
            })
            .collect();
        assert_eq!(
            toggles,
            [ClientMessage::PauseReceiving, ClientMessage::ResumeReceiving]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kicked_is_terminal_and_visible() {
        let device = Arc::new(MemoryDevice::new());
        let (connector, handle, _task) = start(device);
        let mut events = handle.subscribe();
        settle_until(|| connector.opened() == 1).await;

        connector.close_latest("kicked");
        let notice = loop {
            let event = events.recv().await.unwrap();
            if event.from_player == PlayerSlot::SERVER {
                break event;
            }
        };
        assert!(matches!(
            notice.kind,
            EventKind::Chat(ref chat) if chat.message.contains("kicked")
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.opened(), 1);
        let status = handle.status().await.unwrap();
        assert_eq!(status.terminated.as_deref(), Some("kicked"));
        assert!(!status.socket_open);

        // An explicit connect clears the terminal state.
        handle.connect().unwrap();
        settle_until(|| connector.opened() == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn chat_before_handshake_is_refused_locally() {
        let device = Arc::new(MemoryDevice::new());
        let (connector, handle, _task) = start(device);
        let mut events = handle.subscribe();
        settle_until(|| connector.opened() == 1).await;

        handle.send_chat("hello").unwrap();
        let notice = events.recv().await.unwrap();
        assert!(matches!(
            notice.kind,
            EventKind::Chat(ref chat) if chat.message.contains("not sent")
        ));
        assert!(connector.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn item_ahead_of_the_cursor_lands_after_the_gap_fills() {
        let device = Arc::new(MemoryDevice::with_signature("DR_abc_2_1"));
        device.set_auto_consume(true);
        let (connector, handle, _task) = start(device.clone());
        handshake(&connector).await;

        connector.push(&ServerMessage::NewItems(vec![item_for_two(3, 3)]));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(device.delivered().is_empty());
        // Still pending, not lost.
        assert_eq!(handle.status().await.unwrap().queue_len, 1);

        connector.push(&ServerMessage::NewItems(vec![
            item_for_two(1, 1),
            item_for_two(2, 2),
        ]));
        settle_until(|| device.delivered().len() == 3).await;
        let keys: Vec<u8> = device
            .delivered()
            .iter()
            .map(|slot| slot.last_delivered.lo())
            .collect();
        assert_eq!(keys, [1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn forfeit_goes_to_the_directory_once() {
        let device = Arc::new(MemoryDevice::with_signature("DR_abc_2_1"));
        let directory = roster();
        let (connector, handle, _task) = start_with(device, directory.clone());
        let mut events = handle.subscribe();
        handshake(&connector).await;

        handle.forfeit().unwrap();
        notice_containing(&mut events, "Forfeited").await;
        assert_eq!(directory.forfeits(), [PlayerSlot(2)]);

        handle.forfeit().unwrap();
        let refusal = notice_containing(&mut events, "Forfeit failed").await;
        assert!(refusal.contains("already forfeited"));
        assert_eq!(directory.forfeits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forfeit_without_a_game_is_refused_locally() {
        let directory = roster();
        let device = Arc::new(MemoryDevice::new());
        let (connector, handle, _task) = start_with(device, directory.clone());
        let mut events = handle.subscribe();
        settle_until(|| connector.opened() == 1).await;

        handle.forfeit().unwrap();
        notice_containing(&mut events, "Only a player").await;
        assert!(directory.forfeits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_closed_after_shutdown() {
        let device = Arc::new(MemoryDevice::new());
        let (connector, handle, task) = start(device);
        settle_until(|| connector.opened() == 1).await;
        handle.shutdown().unwrap();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status().await, Err(SessionError::Closed));
        assert!(connector.sent().iter().any(|(_, s)| s.starts_with("close:1000")));
    }
}
