// Client configuration.
//
// `ClientConfig` is plain serde data with a `Default` impl, in the same shape
// as the relay-side config it replaced: construct the default, then override
// fields from a JSON file and/or CLI flags. Every field has a default so a
// config file only needs to mention what it changes.
//
// Timing knobs live in `TimingConfig` as millisecond integers (what a human
// writes in JSON) with `Duration` accessors for the code that sleeps on them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Poll cadences, timeouts, and settle delays for the sync engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Identity/snapshot poll period.
    pub poll_interval_ms: u64,
    /// Re-check period while waiting for the game to reach an in-game mode.
    pub ready_poll_interval_ms: u64,
    pub ready_timeout_ms: u64,
    /// Re-check period while waiting for the game to take the pending item.
    pub consume_poll_interval_ms: u64,
    pub consume_timeout_ms: u64,
    /// Pause after each item write.
    pub write_settle_ms: u64,
    /// Pause after the queue drains, before the poller resumes.
    pub drain_settle_ms: u64,
    /// Delay before reopening a socket the relay closed without a reason.
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on any single device read or write.
    pub device_timeout_ms: u64,
    /// How long an unacknowledged `update_memory` blocks the next one.
    pub memory_sync_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            ready_poll_interval_ms: 250,
            ready_timeout_ms: 30_000,
            consume_poll_interval_ms: 250,
            consume_timeout_ms: 30_000,
            write_settle_ms: 250,
            drain_settle_ms: 1000,
            reconnect_delay_ms: 1000,
            connect_timeout_ms: 10_000,
            device_timeout_ms: 2000,
            memory_sync_timeout_ms: 5000,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn consume_poll_interval(&self) -> Duration {
        Duration::from_millis(self.consume_poll_interval_ms)
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms)
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }

    pub fn drain_settle(&self) -> Duration {
        Duration::from_millis(self.drain_settle_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn memory_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_sync_timeout_ms)
    }
}

/// Configuration for one sync session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket base; the session socket is `{relay_url}/ws/{session_id}`.
    pub relay_url: String,
    /// HTTP base for history and roster lookups.
    pub api_url: String,
    pub session_id: String,
    /// Sent as the first frame when set.
    pub password: Option<String>,
    /// Account id. When set, the client can join as a non-player if no
    /// compatible game is loaded.
    pub user_id: Option<i64>,
    pub session_token: Option<String>,
    /// Two-letter signature prefixes this client can deliver into.
    pub compatible_prefixes: Vec<String>,
    /// Leave the pot region out of memory snapshots.
    pub skip_pots: bool,
    /// Leave the sprite region out of memory snapshots.
    pub skip_sprites: bool,
    pub timing: TimingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8000/api/v1".to_owned(),
            api_url: "http://localhost:8000/api/v1".to_owned(),
            session_id: String::new(),
            password: None,
            user_id: None,
            session_token: None,
            compatible_prefixes: vec!["DR".to_owned(), "ER".to_owned()],
            skip_pots: false,
            skip_sprites: false,
            timing: TimingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.trim().is_empty() {
            return Err(ConfigError::MissingSession);
        }
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(ConfigError::Invalid {
                field: "relay_url",
                reason: format!("expected a ws:// or wss:// URL, got {:?}", self.relay_url),
            });
        }
        if let Some(bad) = self
            .compatible_prefixes
            .iter()
            .find(|p| p.len() != 2 || !p.bytes().all(|b| b.is_ascii_uppercase()))
        {
            return Err(ConfigError::Invalid {
                field: "compatible_prefixes",
                reason: format!("{bad:?} is not two uppercase letters"),
            });
        }
        Ok(())
    }

    /// Full WebSocket URL for this session.
    pub fn socket_url(&self) -> String {
        format!(
            "{}/ws/{}",
            self.relay_url.trim_end_matches('/'),
            self.session_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"session_id": "abc", "timing": {"poll_interval_ms": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.session_id, "abc");
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.timing.ready_poll_interval_ms, 250);
        assert_eq!(config.timing.device_timeout(), Duration::from_secs(2));
        assert_eq!(config.compatible_prefixes, ["DR", "ER"]);
    }

    #[test]
    fn socket_url_joins_cleanly() {
        let config = ClientConfig {
            relay_url: "wss://relay.example/api/v1/".into(),
            session_id: "s1".into(),
            ..ClientConfig::default()
        };
        assert_eq!(config.socket_url(), "wss://relay.example/api/v1/ws/s1");
    }

    #[test]
    fn validation() {
        assert!(matches!(
            ClientConfig::default().validate(),
            Err(ConfigError::MissingSession)
        ));

        let mut config = ClientConfig {
            session_id: "s1".into(),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_ok());

        config.compatible_prefixes.push("dr".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "compatible_prefixes",
                ..
            })
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ClientConfig::from_json_file(Path::new("/nonexistent/multiworld.json"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/multiworld.json"));
    }
}
