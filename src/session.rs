//! Per-playback-session state and update-trigger evaluation.
//!
//! A [`PlaybackSession`] is the tracker's record of one continuous playback
//! instance. Each progress observation is folded in by
//! [`observe`](PlaybackSession::observe), which decides whether the event
//! warrants an outbound presence update and then converges the stored state
//! onto the observation either way.

use std::time::Duration;

use tokio::time::Instant;

use crate::artwork::ArtworkStatus;
use crate::media::{self, MediaItem};

/// One active playback instance of one user.
#[derive(Clone, Debug)]
pub struct PlaybackSession {
    /// What is being played.
    pub item: MediaItem,

    /// Last reported playback position.
    pub position_ticks: u64,

    /// Wall-clock time of the last observation, for drift and staleness.
    pub observed_at: Instant,

    /// Paused flag as of the last observation.
    pub paused: bool,

    /// Cleared on every gateway READY so a fresh connection gets an
    /// initial push.
    pub first_update_sent: bool,

    /// Progress of the asynchronous artwork fetch.
    pub artwork: ArtworkStatus,
}

impl PlaybackSession {
    #[must_use]
    pub fn new(item: MediaItem, position_ticks: u64, paused: bool, now: Instant) -> Self {
        Self {
            item,
            position_ticks,
            observed_at: now,
            paused,
            first_update_sent: false,
            artwork: ArtworkStatus::Pending,
        }
    }

    /// Folds one progress observation into the session.
    ///
    /// Returns whether a presence update is warranted:
    ///
    /// 1. before the first update, only once the artwork fetch has settled
    ///    and the connection is ready — a pause or seek observed in that
    ///    window converges the state and is folded into the initial push;
    /// 2. afterwards, when the paused flag flipped;
    /// 3. or when the reported position drifted from the expected position
    ///    by more than `drift_tolerance` (a seek or rewind).
    ///
    /// Position, timestamp and paused flag are persisted unconditionally so
    /// state converges even when no update is sent.
    pub fn observe(
        &mut self,
        position_ticks: u64,
        paused: bool,
        now: Instant,
        ready: bool,
        drift_tolerance: Duration,
    ) -> bool {
        let update = if self.first_update_sent {
            let pause_edge = paused != self.paused;

            // Expected position extrapolates from the wall clock, not from
            // an assumed event cadence: progress events arrive at no fixed
            // rate.
            let elapsed = now.saturating_duration_since(self.observed_at);
            let expected = if self.paused {
                self.position_ticks
            } else {
                self.position_ticks
                    .saturating_add(media::duration_to_ticks(elapsed))
            };
            let drift =
                expected.abs_diff(position_ticks) > media::duration_to_ticks(drift_tolerance);

            pause_edge || drift
        } else {
            self.artwork.is_settled() && ready
        };

        self.position_ticks = position_ticks;
        self.paused = paused;
        self.observed_at = now;

        if update {
            self.first_update_sent = true;
        }
        update
    }

    /// Whether the session has gone without observations for longer than
    /// `timeout` and should be swept.
    #[must_use]
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.observed_at) > timeout
    }
}
