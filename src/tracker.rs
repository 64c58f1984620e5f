//! Tracks playback sessions per user and drives their gateway connections.
//!
//! The tracker is the funnel between the host's unordered, possibly
//! redundant playback notifications and the per-user gateway connections.
//! It owns two levels of concurrent maps: users, and each user's playback
//! sessions. Contexts and sessions are created with insert-if-absent
//! semantics so concurrent events for the same new key resolve to exactly
//! one container.
//!
//! All map access is synchronous; the only asynchronous work (artwork
//! fetches, resource release) runs on detached tasks that re-enter the maps
//! on completion.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;

use crate::artwork::{ArtworkResolver, ArtworkStatus};
use crate::gateway::{Connection, Connector, ReadyHook};
use crate::media::{MediaItem, UserId};
use crate::payload;
use crate::session::PlaybackSession;
use crate::tokens::TokenStore;

/// Tracker tuning.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Position discrepancy treated as a seek/rewind.
    pub drift_tolerance: Duration,

    /// Inactivity after which the sweeper reclaims a session.
    pub session_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            drift_tolerance: Duration::from_secs(5),
            session_timeout: Duration::from_secs(75),
        }
    }
}

/// One tracked user: a gateway connection plus that user's live sessions.
struct UserContext {
    connection: Box<dyn Connection>,
    sessions: Arc<DashMap<String, PlaybackSession>>,
}

struct Inner {
    settings: Settings,
    tokens: Arc<dyn TokenStore>,
    artwork: Arc<dyn ArtworkResolver>,
    connector: Arc<dyn Connector>,
    users: DashMap<UserId, Arc<UserContext>>,
}

/// Cheaply cloneable handle; clones share all state.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(
        settings: Settings,
        tokens: Arc<dyn TokenStore>,
        artwork: Arc<dyn ArtworkResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                tokens,
                artwork,
                connector,
                users: DashMap::new(),
            }),
        }
    }

    /// Folds in one playback progress notification.
    ///
    /// Users without a configured token are skipped deliberately; redelivery
    /// of identical state is a no-op.
    pub fn on_progress(
        &self,
        user_id: UserId,
        play_session_id: &str,
        item: &MediaItem,
        position_ticks: u64,
        paused: bool,
    ) {
        let Some(context) = self.context_for(user_id) else {
            return;
        };
        let now = Instant::now();
        let ready = context.connection.is_ready();

        // The entry guard is held across the synchronous trigger evaluation
        // only; rendering below iterates the map and must not nest inside.
        let update = match context.sessions.entry(play_session_id.to_owned()) {
            Entry::Occupied(mut entry) => entry.get_mut().observe(
                position_ticks,
                paused,
                now,
                ready,
                self.inner.settings.drift_tolerance,
            ),
            Entry::Vacant(entry) => {
                debug!("user {user_id}: new playback session {play_session_id}");
                entry.insert(PlaybackSession::new(item.clone(), position_ticks, paused, now));
                self.spawn_artwork_fetch(play_session_id.to_owned(), item.clone(), &context);
                // Not eligible for its first update until the fetch settles.
                false
            }
        };

        if update {
            self.render(&context);
        }
    }

    /// Folds in one playback stop notification.
    pub fn on_stop(&self, user_id: UserId, play_session_id: &str) {
        let Some(context) = self.inner.users.get(&user_id).map(|c| Arc::clone(&c)) else {
            return;
        };
        self.finish_session(user_id, &context, play_session_id);
    }

    /// Reclaims every session with no recent activity, exactly as if the
    /// host had delivered a stop for it.
    pub fn sweep(&self) {
        let now = Instant::now();
        let timeout = self.inner.settings.session_timeout;

        let mut stale: Vec<(UserId, String)> = Vec::new();
        for user in self.inner.users.iter() {
            for session in user.value().sessions.iter() {
                if session.value().is_stale(now, timeout) {
                    stale.push((*user.key(), session.key().clone()));
                }
            }
        }

        for (user_id, play_session_id) in stale {
            let Some(context) = self.inner.users.get(&user_id).map(|c| Arc::clone(&c)) else {
                continue;
            };
            debug!("user {user_id}: sweeping stale session {play_session_id}");
            self.finish_session(user_id, &context, &play_session_id);
        }
    }

    /// Disposes every connection and forgets all state.
    pub fn shutdown(&self) {
        for user in self.inner.users.iter() {
            user.value().connection.dispose();
        }
        self.inner.users.clear();
    }

    /// Number of currently tracked users.
    #[must_use]
    pub fn tracked_users(&self) -> usize {
        self.inner.users.len()
    }

    fn context_for(&self, user_id: UserId) -> Option<Arc<UserContext>> {
        match self.inner.users.entry(user_id) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let Some(token) = self.inner.tokens.token_for(&user_id) else {
                    trace!("user {user_id}: no gateway token, skipping");
                    return None;
                };

                let sessions: Arc<DashMap<String, PlaybackSession>> = Arc::new(DashMap::new());
                // Re-arm initial pushes on every completed handshake, so a
                // fresh or re-identified connection gets the current state.
                let on_ready: ReadyHook = Arc::new({
                    let sessions = Arc::clone(&sessions);
                    move || {
                        for mut session in sessions.iter_mut() {
                            session.first_update_sent = false;
                        }
                    }
                });

                info!("user {user_id}: opening gateway connection");
                let connection = self.inner.connector.connect(token, on_ready);
                let context = Arc::new(UserContext {
                    connection,
                    sessions,
                });
                entry.insert(Arc::clone(&context));
                Some(context)
            }
        }
    }

    fn spawn_artwork_fetch(
        &self,
        play_session_id: String,
        item: MediaItem,
        context: &Arc<UserContext>,
    ) {
        let resolver = Arc::clone(&self.inner.artwork);
        let context = Arc::clone(context);
        tokio::spawn(async move {
            let status = match resolver.resolve(&item).await {
                Some(artwork) => ArtworkStatus::Resolved(artwork),
                None => ArtworkStatus::Absent,
            };

            if let Some(mut session) = context.sessions.get_mut(&play_session_id) {
                session.artwork = status;
                return;
            }
            // The session ended while the fetch was in flight; do not leak
            // the backing resource.
            if let ArtworkStatus::Resolved(artwork) = status {
                if let Some(handle) = artwork.handle {
                    resolver.release(handle).await;
                }
            }
        });
    }

    /// The shared stop path: host-delivered stops and the sweeper both land
    /// here.
    fn finish_session(&self, user_id: UserId, context: &Arc<UserContext>, play_session_id: &str) {
        let Some((_, session)) = context.sessions.remove(play_session_id) else {
            return;
        };

        if let ArtworkStatus::Resolved(artwork) = session.artwork {
            if let Some(handle) = artwork.handle {
                let resolver = Arc::clone(&self.inner.artwork);
                tokio::spawn(async move { resolver.release(handle).await });
            }
        }

        if context.sessions.is_empty() {
            info!("user {user_id}: last session ended, disposing connection");
            context.connection.dispose();
            self.inner
                .users
                .remove_if(&user_id, |_, current| Arc::ptr_eq(current, context));
        } else {
            debug!("user {user_id}: session {play_session_id} ended, re-rendering");
            self.render(context);
        }
    }

    /// Renders all live sessions of one user into a single merged payload
    /// and hands it to the connection.
    fn render(&self, context: &UserContext) {
        let mut sessions: Vec<(String, PlaybackSession)> = context
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));

        let snapshots: Vec<&PlaybackSession> = sessions.iter().map(|(_, s)| s).collect();
        let activities = payload::build(&snapshots, SystemTime::now());
        context.connection.send_presence(activities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::artwork::{Artwork, ResourceHandle};
    use crate::media::TICKS_PER_SECOND;
    use crate::protocol::activity::Activity;
    use crate::tokens::{ConfigTokenStore, UserToken};

    const SECOND: u64 = TICKS_PER_SECOND;

    fn item(title: &str) -> MediaItem {
        MediaItem {
            title: title.to_string(),
            series: None,
            season: None,
            episode: None,
            external_id: None,
            runtime_ticks: Some(30 * 60 * SECOND),
        }
    }

    /// Connection stub: records payloads, readiness is externally driven.
    struct StubConnection {
        ready: Arc<AtomicBool>,
        disposed: Arc<AtomicBool>,
        sent: Arc<Mutex<Vec<Vec<Activity>>>>,
    }

    impl Connection for StubConnection {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }

        fn send_presence(&self, activities: Vec<Activity>) {
            if self.is_ready() {
                self.sent.lock().unwrap().push(activities);
            }
        }

        fn clear_presence(&self) {
            self.send_presence(Vec::new());
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::Release);
        }
    }

    /// Connector stub: hands out ready-to-go connections and counts them.
    struct StubConnector {
        connects: AtomicUsize,
        ready_immediately: bool,
        ready: Mutex<Vec<Arc<AtomicBool>>>,
        hooks: Mutex<Vec<ReadyHook>>,
        disposed: Mutex<Vec<Arc<AtomicBool>>>,
        sent: Mutex<Vec<Arc<Mutex<Vec<Vec<Activity>>>>>>,
    }

    impl StubConnector {
        fn new(ready_immediately: bool) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                ready_immediately,
                ready: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
                disposed: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::Acquire)
        }

        /// Simulates the n-th connection completing its handshake.
        fn mark_ready(&self, index: usize) {
            self.ready.lock().unwrap()[index].store(true, Ordering::Release);
            let hook = Arc::clone(&self.hooks.lock().unwrap()[index]);
            hook();
        }

        fn sent_payloads(&self, index: usize) -> Vec<Vec<Activity>> {
            self.sent.lock().unwrap()[index].lock().unwrap().clone()
        }

        fn is_disposed(&self, index: usize) -> bool {
            self.disposed.lock().unwrap()[index].load(Ordering::Acquire)
        }
    }

    impl Connector for StubConnector {
        fn connect(&self, _token: UserToken, on_ready: ReadyHook) -> Box<dyn Connection> {
            self.connects.fetch_add(1, Ordering::AcqRel);
            let ready = Arc::new(AtomicBool::new(false));
            let disposed = Arc::new(AtomicBool::new(false));
            let sent = Arc::new(Mutex::new(Vec::new()));

            self.ready.lock().unwrap().push(Arc::clone(&ready));
            self.hooks.lock().unwrap().push(Arc::clone(&on_ready));
            self.disposed.lock().unwrap().push(Arc::clone(&disposed));
            self.sent.lock().unwrap().push(Arc::clone(&sent));

            if self.ready_immediately {
                ready.store(true, Ordering::Release);
                on_ready();
            }

            Box::new(StubConnection {
                ready,
                disposed,
                sent,
            })
        }
    }

    /// Resolver stub: settles immediately, optionally with artwork.
    struct StubResolver {
        artwork: Option<Artwork>,
        released: Arc<Mutex<Vec<ResourceHandle>>>,
    }

    impl StubResolver {
        fn absent() -> Arc<Self> {
            Arc::new(Self {
                artwork: None,
                released: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn with_handle(handle: u64) -> Arc<Self> {
            Arc::new(Self {
                artwork: Some(Artwork {
                    image: "https://img.example/poster.jpg".to_string(),
                    caption: None,
                    handle: Some(ResourceHandle(handle)),
                }),
                released: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    #[async_trait]
    impl ArtworkResolver for StubResolver {
        async fn resolve(&self, _item: &MediaItem) -> Option<Artwork> {
            self.artwork.clone()
        }

        async fn release(&self, handle: ResourceHandle) {
            self.released.lock().unwrap().push(handle);
        }
    }

    fn store_with(users: &[UserId]) -> Arc<ConfigTokenStore> {
        let mut tokens = HashMap::new();
        for user in users {
            tokens.insert(*user, UserToken::new("token").unwrap());
        }
        Arc::new(ConfigTokenStore::new(tokens))
    }

    fn tracker(
        connector: &Arc<StubConnector>,
        resolver: &Arc<StubResolver>,
        users: &[UserId],
    ) -> PresenceTracker {
        PresenceTracker::new(
            Settings {
                drift_tolerance: Duration::from_secs(5),
                session_timeout: Duration::from_secs(15),
            },
            store_with(users),
            Arc::clone(resolver) as Arc<dyn ArtworkResolver>,
            Arc::clone(connector) as Arc<dyn Connector>,
        )
    }

    /// Lets detached artwork tasks run to completion on the current-thread
    /// test runtime.
    async fn settle() {
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn user_without_token_is_skipped() {
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[]);

        tracker.on_progress(UserId::from_u128(1), "s1", &item("Ep 1"), 0, false);

        assert_eq!(connector.connect_count(), 0);
        assert_eq!(tracker.tracked_users(), 0);
    }

    #[tokio::test]
    async fn first_update_flows_once_artwork_settles() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        assert_eq!(connector.connect_count(), 1);
        // Creation event alone pushes nothing: artwork is still pending.
        assert_eq!(connector.sent_payloads(0).len(), 0);

        settle().await;
        tracker.on_progress(user, "s1", &item("Ep 1"), SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 1);

        // Consistent follow-ups stay quiet.
        tracker.on_progress(user, "s1", &item("Ep 1"), SECOND, false);
        tracker.on_progress(user, "s1", &item("Ep 1"), SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_edges_each_send_one_update() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        settle().await;
        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        assert_eq!(connector.sent_payloads(0).len(), 1);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, true);
        tracker.on_progress(user, "s1", &item("Ep 1"), 0, true);
        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        tracker.on_progress(user, "s1", &item("Ep 1"), 0, true);

        // initial + pause + unpause + pause
        assert_eq!(connector.sent_payloads(0).len(), 4);
        let last = connector.sent_payloads(0).pop().unwrap();
        assert!(last[0].name.starts_with(crate::payload::PAUSED_MARKER));
    }

    #[tokio::test]
    async fn seek_fires_exactly_one_update() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        settle().await;
        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        assert_eq!(connector.sent_payloads(0).len(), 1);

        // A ten-minute jump in negligible wall-clock time.
        tracker.on_progress(user, "s1", &item("Ep 1"), 600 * SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 2);
        tracker.on_progress(user, "s1", &item("Ep 1"), 600 * SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 2);
    }

    #[tokio::test]
    async fn early_seek_does_not_bypass_the_artwork_gate() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::with_handle(42);
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        // A seek observed before the fetch settles must not push a payload
        // that would be missing its artwork.
        tracker.on_progress(user, "s1", &item("Ep 1"), 600 * SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 0);

        settle().await;
        tracker.on_progress(user, "s1", &item("Ep 1"), 600 * SECOND, false);
        let sent = connector.sent_payloads(0);
        assert_eq!(sent.len(), 1);
        assert!(sent[0][0].assets.is_some());
    }

    #[tokio::test]
    async fn concurrent_sessions_merge_with_distinct_names() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        tracker.on_progress(user, "s2", &item("Ep 1"), 0, false);
        settle().await;
        tracker.on_progress(user, "s1", &item("Ep 1"), SECOND, false);

        assert_eq!(connector.connect_count(), 1);
        let merged = connector.sent_payloads(0).pop().unwrap();
        assert_eq!(merged.len(), 2);
        assert_ne!(merged[0].name, merged[1].name);
    }

    #[tokio::test]
    async fn stopping_one_session_rerenders_the_rest() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        tracker.on_progress(user, "s2", &item("Ep 2"), 0, false);
        settle().await;

        tracker.on_stop(user, "s1");
        let merged = connector.sent_payloads(0).pop().unwrap();
        assert_eq!(merged.len(), 1);
        assert!(!connector.is_disposed(0));

        tracker.on_stop(user, "s2");
        assert!(connector.is_disposed(0));
        assert_eq!(tracker.tracked_users(), 0);
    }

    #[tokio::test]
    async fn stop_redelivery_is_idempotent() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        settle().await;
        tracker.on_stop(user, "s1");
        tracker.on_stop(user, "s1");
        tracker.on_stop(user, "s1");

        assert_eq!(tracker.tracked_users(), 0);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn stop_releases_the_artwork_resource() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::with_handle(42);
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        settle().await;
        tracker.on_stop(user, "s1");
        settle().await;

        assert_eq!(*resolver.released.lock().unwrap(), vec![ResourceHandle(42)]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_stale_sessions_only() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        settle().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        // s2 starts later and stays fresh.
        tracker.on_progress(user, "s2", &item("Ep 2"), 0, false);
        settle().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        // s1 is now 20s old against a 15s timeout; s2 only 10s.
        tracker.sweep();

        assert!(!connector.is_disposed(0));
        let merged = connector.sent_payloads(0).pop().unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "Ep 2");

        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.sweep();
        assert!(connector.is_disposed(0));
        assert_eq!(tracker.tracked_users(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_after_sweep_opens_a_brand_new_connection() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 3"), 0, false);
        settle().await;
        assert_eq!(connector.connect_count(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.sweep();
        assert!(connector.is_disposed(0));

        tracker.on_progress(user, "s1", &item("Ep 3"), 0, false);
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(tracker.tracked_users(), 1);
    }

    #[tokio::test]
    async fn ready_hook_rearms_the_initial_push() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(false);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        tracker.on_progress(user, "s1", &item("Ep 1"), 0, false);
        settle().await;

        // Artwork settled but the connection has not finished its
        // handshake: nothing may flow yet.
        tracker.on_progress(user, "s1", &item("Ep 1"), SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 0);

        connector.mark_ready(0);
        tracker.on_progress(user, "s1", &item("Ep 1"), 2 * SECOND, false);
        assert_eq!(connector.sent_payloads(0).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_resolves_to_one_context() {
        let user = UserId::from_u128(1);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[user]);

        let mut handles = Vec::new();
        for i in 0..8_u64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.on_progress(user, "s1", &item("Ep 1"), i * SECOND, false);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(tracker.tracked_users(), 1);
    }

    #[tokio::test]
    async fn shutdown_disposes_every_connection() {
        let first = UserId::from_u128(1);
        let second = UserId::from_u128(2);
        let connector = StubConnector::new(true);
        let resolver = StubResolver::absent();
        let tracker = tracker(&connector, &resolver, &[first, second]);

        tracker.on_progress(first, "s1", &item("Ep 1"), 0, false);
        tracker.on_progress(second, "s1", &item("Ep 1"), 0, false);
        assert_eq!(connector.connect_count(), 2);

        tracker.shutdown();
        assert!(connector.is_disposed(0));
        assert!(connector.is_disposed(1));
        assert_eq!(tracker.tracked_users(), 0);
    }
}
