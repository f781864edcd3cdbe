// HTTP session directory: historical events, the player roster, forfeits.
//
// The relay's REST API exposes two read-only collaborators the sync engine
// uses on every (re)connect:
// - `GET {api}/session/{id}/events`: every persisted event, oldest first.
//   Rows use numeric event types and RFC 3339 timestamps (see `RawEvent`).
//   They carry no per-recipient sequence keys, so historical items are
//   shown in the log but never delivered from history.
// - `GET {api}/session/{id}/players`: player names, slot `n` at index
//   `n - 1`.
//
// One write: `POST {api}/session/{id}/player_forfeit` with `{"player_id": n}`
// gives up for player `n`. The relay answers `{found_item_count,
// forfeit_item_count}` or, with status 200, `{"error": ...}` (already
// forfeited, unknown session); the latter becomes `DirectoryError::Rejected`.
//
// `SessionDirectory` is the seam; `HttpDirectory` talks to the real API and
// `StaticDirectory` serves fixed data for offline runs and tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use multiworld_protocol::{PlayerSlot, RawEvent};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DirectoryError;

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn fetch_events(&self, session_id: &str) -> Result<Vec<RawEvent>, DirectoryError>;

    async fn fetch_roster(&self, session_id: &str) -> Result<Vec<String>, DirectoryError>;

    async fn forfeit(
        &self,
        session_id: &str,
        player: PlayerSlot,
    ) -> Result<ForfeitSummary, DirectoryError>;
}

/// What a forfeit released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ForfeitSummary {
    /// Items of the player's that had already been found.
    #[serde(default)]
    pub found_item_count: u32,
    /// Items sent out to their owners by the forfeit.
    #[serde(default)]
    pub forfeit_item_count: u32,
}

#[derive(Serialize)]
struct ForfeitRequest {
    player_id: PlayerSlot,
}

#[derive(Deserialize)]
struct ForfeitResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    summary: ForfeitSummary,
}

pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| DirectoryError::Http {
                url: base_url.to_owned(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<T, DirectoryError> {
        let url = format!("{}/session/{session_id}/{path}", self.base_url);
        debug!(%url, "fetching");
        let http = |source| DirectoryError::Http {
            url: url.clone(),
            source,
        };
        let response = self.client.get(&url).send().await.map_err(http)?;
        Self::decode(response, session_id, &url).await
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        session_id: &str,
        url: &str,
    ) -> Result<T, DirectoryError> {
        let http = |source| DirectoryError::Http {
            url: url.to_owned(),
            source,
        };
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(session_id.to_owned()));
        }
        response
            .error_for_status()
            .map_err(http)?
            .json::<T>()
            .await
            .map_err(http)
    }
}

#[async_trait]
impl SessionDirectory for HttpDirectory {
    async fn fetch_events(&self, session_id: &str) -> Result<Vec<RawEvent>, DirectoryError> {
        self.get_json(session_id, "events").await
    }

    async fn fetch_roster(&self, session_id: &str) -> Result<Vec<String>, DirectoryError> {
        self.get_json(session_id, "players").await
    }

    async fn forfeit(
        &self,
        session_id: &str,
        player: PlayerSlot,
    ) -> Result<ForfeitSummary, DirectoryError> {
        let url = format!("{}/session/{session_id}/player_forfeit", self.base_url);
        debug!(%url, %player, "forfeiting");
        let response = self
            .client
            .post(&url)
            .json(&ForfeitRequest { player_id: player })
            .send()
            .await
            .map_err(|source| DirectoryError::Http {
                url: url.clone(),
                source,
            })?;
        let answer: ForfeitResponse = Self::decode(response, session_id, &url).await?;
        match answer.error {
            Some(reason) => Err(DirectoryError::Rejected(reason)),
            None => Ok(answer.summary),
        }
    }
}

/// Fixed history and roster. Forfeits are recorded, once per player.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory {
    pub events: Vec<RawEvent>,
    pub roster: Vec<String>,
    pub forfeited: Arc<Mutex<Vec<PlayerSlot>>>,
}

impl StaticDirectory {
    pub fn forfeits(&self) -> Vec<PlayerSlot> {
        self.forfeited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SessionDirectory for StaticDirectory {
    async fn fetch_events(&self, _session_id: &str) -> Result<Vec<RawEvent>, DirectoryError> {
        Ok(self.events.clone())
    }

    async fn fetch_roster(&self, _session_id: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self.roster.clone())
    }

    async fn forfeit(
        &self,
        _session_id: &str,
        player: PlayerSlot,
    ) -> Result<ForfeitSummary, DirectoryError> {
        let mut forfeited = self.forfeited.lock().unwrap_or_else(PoisonError::into_inner);
        if forfeited.contains(&player) {
            return Err(DirectoryError::Rejected("Player already forfeited".to_owned()));
        }
        forfeited.push(player);
        Ok(ForfeitSummary::default())
    }
}
