//! Media item identity as reported by the host, plus tick conversions.
//!
//! The host reports playback positions and durations in ticks of 100 ns,
//! which is what all position math in this crate works in. Conversions to
//! wall-clock units happen at the edges: drift detection and the payload
//! builder.

use std::time::Duration;

use uuid::Uuid;

/// Host-assigned user identity.
pub type UserId = Uuid;

/// Host position/duration resolution: one tick is 100 ns.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Ticks per millisecond, for wire timestamps.
pub const TICKS_PER_MILLISECOND: u64 = 10_000;

/// Converts a tick count into a [`Duration`].
#[must_use]
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_millis(ticks / TICKS_PER_MILLISECOND)
}

/// Converts a [`Duration`] into ticks, saturating at `u64::MAX`.
#[must_use]
pub fn duration_to_ticks(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .saturating_mul(TICKS_PER_MILLISECOND)
}

/// What is being played, as far as presence rendering is concerned.
///
/// Identity is by value: two progress events describe the same item iff all
/// fields match. The tracker never mutates an item after session creation.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MediaItem {
    /// Episode or movie title.
    pub title: String,

    /// Series title, when the item is an episode.
    pub series: Option<String>,

    /// Season number within the series.
    pub season: Option<u32>,

    /// Episode number within the season.
    pub episode: Option<u32>,

    /// External catalogue id (IMDb), used for links and artwork lookup.
    pub external_id: Option<String>,

    /// Total runtime in ticks, when the host knows it.
    pub runtime_ticks: Option<u64>,
}

impl MediaItem {
    /// Parent-context line: series and numbering when the item is an
    /// episode, the top-level title otherwise.
    #[must_use]
    pub fn detail_line(&self) -> String {
        match (&self.series, self.season, self.episode) {
            (Some(series), Some(season), Some(episode)) => {
                format!("{series} · S{season}E{episode}")
            }
            (Some(series), _, Some(episode)) => format!("{series} · E{episode}"),
            (Some(series), _, _) => series.clone(),
            _ => self.title.clone(),
        }
    }

    /// Externally reachable catalogue page, when an external id is known.
    #[must_use]
    pub fn external_url(&self) -> Option<String> {
        self.external_id
            .as_ref()
            .map(|id| format!("https://www.imdb.com/title/{id}/"))
    }

    /// Total runtime, when the host reported one.
    #[must_use]
    pub fn runtime(&self) -> Option<Duration> {
        self.runtime_ticks.map(ticks_to_duration)
    }
}
