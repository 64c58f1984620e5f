//! Media-server session polling.
//!
//! The tracker itself is transport-agnostic; this module is the binary's
//! default host event source. It polls the server's `/Sessions` endpoint
//! and translates the returned playback state into progress events, and
//! the disappearance of a play session between polls into a stop event.
//! A session the server never reports as stopped (crash, network drop) is
//! the sweeper's problem, not ours.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;
use veil::Redact;

use crate::config::HostSettings;
use crate::media::{MediaItem, UserId};
use crate::tracker::PresenceTracker;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("parsing URL failed: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// One entry of the `/Sessions` response; only the fields presence needs.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    pub id: String,
    pub user_id: UserId,
    pub now_playing_item: Option<NowPlayingItem>,
    pub play_state: Option<PlayState>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NowPlayingItem {
    pub name: String,
    pub series_name: Option<String>,
    pub parent_index_number: Option<u32>,
    pub index_number: Option<u32>,
    pub run_time_ticks: Option<u64>,
    #[serde(default)]
    pub provider_ids: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayState {
    pub position_ticks: Option<u64>,
    #[serde(default)]
    pub is_paused: bool,
}

impl NowPlayingItem {
    /// Maps the host's item shape onto the tracker's.
    #[must_use]
    pub fn to_media_item(&self) -> MediaItem {
        MediaItem {
            title: self.name.clone(),
            series: self.series_name.clone(),
            season: self.parent_index_number,
            episode: self.index_number,
            external_id: self.provider_ids.get("Imdb").cloned(),
            runtime_ticks: self.run_time_ticks,
        }
    }
}

/// Polls the media server and feeds the tracker.
#[derive(Redact)]
pub struct Host {
    client: reqwest::Client,
    sessions_url: Url,
    #[redact]
    api_key: String,
    poll_interval: Duration,
}

impl Host {
    pub fn new(settings: &HostSettings, user_agent: &str, poll_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        let sessions_url = settings.url.join("Sessions")?;

        Ok(Self {
            client,
            sessions_url,
            api_key: settings.api_key.clone(),
            poll_interval,
        })
    }

    /// Polls until cancelled. Poll failures are logged and retried on the
    /// next tick; the server being briefly unreachable must not tear down
    /// presence state.
    pub async fn run(&self, tracker: &PresenceTracker, shutdown: &CancellationToken) {
        let mut live: HashSet<(UserId, String)> = HashSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.fetch_sessions().await {
                Ok(sessions) => {
                    let seen = dispatch_progress(tracker, &sessions);
                    for (user_id, play_session_id) in live.difference(&seen) {
                        tracker.on_stop(*user_id, play_session_id);
                    }
                    live = seen;
                }
                Err(e) => warn!("session poll failed: {e}"),
            }
        }
    }

    async fn fetch_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.client
            .get(self.sessions_url.clone())
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<SessionInfo>>()
            .await
            .map_err(Into::into)
    }
}

/// Feeds every actively playing session into the tracker and returns the
/// set of live (user, play-session) pairs for stop diffing.
fn dispatch_progress(
    tracker: &PresenceTracker,
    sessions: &[SessionInfo],
) -> HashSet<(UserId, String)> {
    let mut seen = HashSet::new();

    for session in sessions {
        let (Some(item), Some(state)) = (&session.now_playing_item, &session.play_state) else {
            continue;
        };
        tracker.on_progress(
            session.user_id,
            &session.id,
            &item.to_media_item(),
            state.position_ticks.unwrap_or(0),
            state.is_paused,
        );
        seen.insert((session.user_id, session.id.clone()));
    }

    seen
}
