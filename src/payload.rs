//! Renders a user's live sessions into one wire-ready activity list.
//!
//! Pure and deterministic: the caller supplies "now", so the same inputs
//! always produce the same payload. The tracker feeds it sessions in a
//! stable order (by play-session id).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::media;
use crate::protocol::activity::{Activity, Assets, Timestamps};
use crate::session::PlaybackSession;

/// Visible marker prefixed to the display text of paused sessions.
pub const PAUSED_MARKER: &str = "⏸ ";

/// Invisible suffix distinguishing activities that would otherwise render
/// identical names; the gateway rejects duplicate names in one list.
const DISAMBIGUATOR: char = '\u{200B}';

/// Builds one activity per session.
#[must_use]
pub fn build(sessions: &[&PlaybackSession], now: SystemTime) -> Vec<Activity> {
    let now_millis = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    let now_millis = u64::try_from(now_millis).unwrap_or(u64::MAX);

    let mut names: Vec<String> = Vec::with_capacity(sessions.len());
    let mut activities = Vec::with_capacity(sessions.len());

    for session in sessions {
        let mut name = if session.paused {
            format!("{PAUSED_MARKER}{}", session.item.title)
        } else {
            session.item.title.clone()
        };
        while names.contains(&name) {
            name.push(DISAMBIGUATOR);
        }
        names.push(name.clone());

        let mut activity = Activity::watching(name);
        activity.details = Some(session.item.detail_line());
        activity.details_url = session.item.external_url();

        if !session.paused {
            let position = media::ticks_to_duration(session.position_ticks).as_millis();
            let position = u64::try_from(position).unwrap_or(u64::MAX);
            let start = now_millis.saturating_sub(position);
            let end = session
                .item
                .runtime()
                .map(|runtime| start.saturating_add(u64::try_from(runtime.as_millis()).unwrap_or(u64::MAX)));
            activity.timestamps = Some(Timestamps {
                start: Some(start),
                end,
            });
        }

        if let Some(artwork) = session.artwork.artwork() {
            activity.assets = Some(Assets {
                large_image: Some(artwork.image.clone()),
                large_text: artwork.caption.clone(),
                large_url: session.item.external_url(),
                ..Assets::default()
            });
        }

        activities.push(activity);
    }

    activities
}
