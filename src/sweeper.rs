//! Periodic reclamation of abandoned playback sessions.
//!
//! The sweeper is the sole backstop against a host that keeps updating
//! state but never signals playback end (crash, network partition). It
//! runs for the process lifetime and funnels every reclaimed session
//! through the same stop path a host-delivered stop would take.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tracker::PresenceTracker;

/// Spawns the sweep loop onto the current runtime.
///
/// The period should be well below the tracker's session timeout so a
/// stale session is reclaimed within one timeout plus one period.
pub fn spawn(
    tracker: PresenceTracker,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("sweeper running every {:.0?}", period);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(period) => tracker.sweep(),
            }
        }
        debug!("sweeper stopped");
    })
}
