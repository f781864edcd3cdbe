// CLI entry point: `multiworld`, a line-oriented multiworld session client.
//
// Connects to one relay session and echoes every logged event to stdout.
// Lines typed on stdin are commands:
//   /pause       stop receiving items
//   /resume      resume receiving items
//   /reconnect   drop the socket and identity and start over
//   /forfeit     give up; the relay sends our remaining items to their owners
//   /status      print a session status snapshot
//   /quit        close the session and exit
//   anything else is sent as chat.
//
// The device side is an in-memory `MemoryDevice`. `--simulate-signature`
// loads a game with that signature and consumes delivered items
// immediately, which is enough to watch the delivery pipeline end to end.
//
// Logging goes to stderr via tracing-subscriber. `MULTIWORLD_LOG` takes an
// `EnvFilter` directive (default `multiworld_client=info,warn`);
// `MULTIWORLD_LOG_FORMAT=json` switches from compact to JSON lines.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::Parser;
use multiworld_client::{
    ClientConfig, HttpDirectory, MemoryDevice, SessionCoordinator, SessionDirectory,
    SessionStatus, StaticDirectory, WsConnector,
};
use multiworld_protocol::{Event, EventKind, PlayerSlot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "multiworld",
    version,
    about = "Join a multiworld relay session and deliver received items to the game"
)]
struct Cli {
    /// JSON config file; flags below override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    session: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// WebSocket base URL, e.g. wss://relay.example/api/v1
    #[arg(long)]
    relay_url: Option<String>,

    /// HTTP base URL for history and roster lookups.
    #[arg(long)]
    api_url: Option<String>,

    /// Account id; allows joining as a non-player when no game is loaded.
    #[arg(long)]
    user_id: Option<i64>,

    #[arg(long)]
    session_token: Option<String>,

    /// Run against an in-memory game with this ROM signature.
    #[arg(long, value_name = "SIGNATURE")]
    simulate_signature: Option<String>,

    /// Skip the HTTP history and roster fetch.
    #[arg(long)]
    no_history: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_json_file(path)?,
            None => ClientConfig::default(),
        };
        if let Some(session) = &self.session {
            config.session_id = session.clone();
        }
        if let Some(url) = &self.relay_url {
            config.relay_url = url.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if self.password.is_some() {
            config.password = self.password.clone();
        }
        if self.user_id.is_some() {
            config.user_id = self.user_id;
        }
        if self.session_token.is_some() {
            config.session_token = self.session_token.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let device = Arc::new(match &cli.simulate_signature {
        Some(signature) => {
            let device = MemoryDevice::with_signature(signature);
            device.set_auto_consume(true);
            device
        }
        None => MemoryDevice::new(),
    });
    let directory: Arc<dyn SessionDirectory> = if cli.no_history {
        Arc::new(StaticDirectory::default())
    } else {
        Arc::new(
            HttpDirectory::new(&config.api_url, config.timing.connect_timeout())
                .context("building HTTP client")?,
        )
    };
    let connector = Arc::new(WsConnector::new(config.timing.connect_timeout()));

    println!("Joining session {} at {}", config.session_id, config.socket_url());
    let (handle, task) = SessionCoordinator::spawn(config, connector, device, directory);
    let printer = tokio::spawn(print_events(handle.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/pause" => handle.pause_receiving()?,
            "/resume" => handle.resume_receiving()?,
            "/reconnect" => handle.reconnect("requested by user")?,
            "/forfeit" => handle.forfeit()?,
            "/status" => print_status(&handle.status().await?),
            text => handle.send_chat(text)?,
        }
    }

    // Already gone if the session task exited on its own.
    let _ = handle.shutdown();
    task.await.context("session task failed")?;
    printer.abort();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MULTIWORLD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("multiworld_client=info,warn"));
    let format = env::var("MULTIWORLD_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", describe(&event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(event: &Event) -> String {
    let time = DateTime::from_timestamp_millis(event.timestamp_ms)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_owned());
    let who = |name: &Option<String>| name.clone().unwrap_or_else(|| event.from_player.to_string());

    let body = match &event.kind {
        EventKind::Chat(chat) if event.from_player == PlayerSlot::SERVER => {
            format!("* {}", chat.message)
        }
        EventKind::Chat(chat) => format!("<{}> {}", event.from_player, chat.message),
        EventKind::Command(chat) => format!("{} ran {}", event.from_player, chat.message),
        EventKind::NewItem(item) => {
            let name = item
                .item_name
                .clone()
                .unwrap_or_else(|| format!("item {}", item.item_id));
            format!("{} sent {name} to {}", event.from_player, event.to_player)
        }
        EventKind::PlayerJoin(p) => format!("{} joined", who(&p.player_name)),
        EventKind::FailedJoin(p) => format!("{} failed to join", who(&p.player_name)),
        EventKind::PlayerLeave(p) => format!("{} left", who(&p.player_name)),
        EventKind::PlayerForfeit(p) => format!("{} forfeited", who(&p.player_name)),
        EventKind::PlayerPauseReceive(p) => format!("{} paused receiving", who(&p.player_name)),
        EventKind::PlayerResumeReceive(p) => {
            format!("{} resumed receiving", who(&p.player_name))
        }
        other => other.name().to_owned(),
    };
    let marker = if event.historical { " (history)" } else { "" };
    format!("[{time}]{marker} {body}")
}

fn print_status(status: &SessionStatus) {
    println!("connection:  {:?} (socket open: {})", status.connection, status.socket_open);
    if let Some(reason) = &status.terminated {
        println!("terminated:  {reason}");
    }
    println!(
        "identity:    {} {:?} {}",
        status.identity.player_id,
        status.identity.player_type,
        status.identity.rom_name.as_deref().unwrap_or("-")
    );
    println!("device:      {:?}", status.device);
    match status.device_cursor {
        Some(cursor) => println!("cursor:      {cursor}"),
        None => println!("cursor:      -"),
    }
    println!(
        "queue:       {} pending, paused: {}, receiving: {}",
        status.queue_len, status.paused, status.receiving
    );
    if let Some(at) = status.last_snapshot_at {
        println!("last sync:   {}", at.with_timezone(&Local).format("%H:%M:%S"));
    }
    println!("events:      {}", status.events_logged);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file_fields() {
        let cli = Cli::parse_from([
            "multiworld",
            "--session",
            "abc",
            "--relay-url",
            "wss://relay.example/api/v1",
            "--user-id",
            "7",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.session_id, "abc");
        assert_eq!(config.user_id, Some(7));
        assert_eq!(config.socket_url(), "wss://relay.example/api/v1/ws/abc");
    }

    #[test]
    fn missing_session_is_rejected() {
        let cli = Cli::parse_from(["multiworld"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn server_chat_is_starred() {
        let event = Event::system_notice("Unknown command", 0);
        assert!(describe(&event).ends_with("* Unknown command"));
    }
}
