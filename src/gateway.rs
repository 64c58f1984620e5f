//! Persistent gateway connections, one per tracked user.
//!
//! Each connection owns its websocket exclusively and runs the
//! identify/resume/heartbeat protocol on a background task. The protocol
//! decisions live in [`Machine`], which is synchronous and free of I/O so
//! the handshake and reconnect rules are testable without a socket; the
//! [`Runner`] task interprets its decisions against the wire.
//!
//! The tracker talks to connections through the [`Connection`] trait and
//! creates them through [`Connector`], so tests can substitute both.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    tungstenite::Message as WebsocketMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocol::activity::Activity;
use crate::protocol::frames::{
    ClientProperties, Frame, Hello, Opcode, PresenceUpdate, Ready, EVENT_READY, EVENT_RESUMED,
};
use crate::protocol::GATEWAY_VERSION;
use crate::tokens::UserToken;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Invoked on every completed handshake so the owner can re-arm initial
/// presence pushes.
pub type ReadyHook = Arc<dyn Fn() + Send + Sync>;

/// Outbound surface of one gateway connection.
pub trait Connection: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Pushes a presence update. Silently dropped (not queued) while the
    /// connection is not ready; the next trigger re-attempts.
    fn send_presence(&self, activities: Vec<Activity>);

    /// Explicit empty-activity-list update.
    fn clear_presence(&self);

    /// Terminal: stops the heartbeat loop and closes the socket without
    /// reconnecting.
    fn dispose(&self);
}

/// Creates connections; the tracker's seam for tests.
pub trait Connector: Send + Sync {
    fn connect(&self, token: UserToken, on_ready: ReadyHook) -> Box<dyn Connection>;
}

/// Connection tuning shared by every gateway connection.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Well-known gateway URL used for fresh handshakes.
    pub url: Url,

    /// Client properties declared on IDENTIFY.
    pub properties: ClientProperties,

    /// Cooldown before reconnecting after a server-signaled invalid
    /// session.
    pub invalid_session_cooldown: Duration,

    /// Base delay before retrying a failed socket connect.
    pub connect_retry_delay: Duration,
}

enum Command {
    Presence(Vec<Activity>),
    Clear,
}

/// Handle to a live gateway connection task.
pub struct Gateway {
    ready: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Connection for Gateway {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn send_presence(&self, activities: Vec<Activity>) {
        if self.is_ready() {
            let _ = self.commands.send(Command::Presence(activities));
        }
    }

    fn clear_presence(&self) {
        if self.is_ready() {
            let _ = self.commands.send(Command::Clear);
        }
    }

    fn dispose(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spawns real gateway connections onto the current runtime.
#[derive(Clone, Debug)]
pub struct GatewayConnector {
    settings: Settings,
}

impl GatewayConnector {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Connector for GatewayConnector {
    fn connect(&self, token: UserToken, on_ready: ReadyHook) -> Box<dyn Connection> {
        let ready = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let runner = Runner {
            settings: self.settings.clone(),
            machine: Machine::new(token, self.settings.properties.clone()),
            ready: Arc::clone(&ready),
            on_ready,
            commands: command_rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(runner.run());

        Box::new(Gateway {
            ready,
            commands,
            shutdown,
        })
    }
}

/// Resume state cached from the last READY.
#[derive(Clone, Debug)]
struct ResumeState {
    session_id: String,
    gateway_url: String,
}

/// What the I/O task should do with a handled frame.
#[derive(Debug)]
enum Step {
    /// Nothing to do beyond the sequence bookkeeping.
    Continue,
    /// HELLO was received: send the reply and start heartbeating.
    Handshake { interval: Duration, reply: Frame },
    /// READY or RESUMED was received: readiness flagged; READY also caches
    /// fresh resume state.
    Ready,
    /// Tear down the socket. `resume: false` also demands the
    /// invalid-session cooldown before the next attempt.
    Reconnect { resume: bool },
}

/// Synchronous protocol state: sequence/resume bookkeeping and the
/// identify-versus-resume decision.
struct Machine {
    token: UserToken,
    properties: ClientProperties,
    resume: Option<ResumeState>,
    last_seq: Option<u64>,
    ready: bool,
}

impl Machine {
    fn new(token: UserToken, properties: ClientProperties) -> Self {
        Self {
            token,
            properties,
            resume: None,
            last_seq: None,
            ready: false,
        }
    }

    /// The URL to connect to: the cached resume URL after a completed
    /// handshake, the well-known URL otherwise.
    fn connect_url(&self, well_known: &Url) -> String {
        let base = self
            .resume
            .as_ref()
            .map_or_else(|| well_known.as_str().trim_end_matches('/'), |resume| {
                resume.gateway_url.trim_end_matches('/')
            });
        format!("{base}/?v={GATEWAY_VERSION}&encoding=json")
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn heartbeat(&self) -> Frame {
        Frame::heartbeat(self.last_seq)
    }

    /// Folds one inbound frame into the state.
    ///
    /// Sequence numbers are cached from every frame that carries one,
    /// regardless of opcode. Malformed payloads are logged and ignored;
    /// the state machine is unaffected.
    fn handle_frame(&mut self, frame: &Frame) -> Step {
        if let Some(seq) = frame.s {
            self.last_seq = Some(seq);
        }

        match frame.op {
            Opcode::Hello => match frame.payload::<Hello>() {
                Ok(hello) => {
                    let interval = Duration::from_millis(hello.heartbeat_interval);
                    // Resume only with a complete cache; a session id
                    // without a sequence number cannot be resumed.
                    let reply = match (&self.resume, self.last_seq) {
                        (Some(resume), Some(seq)) => {
                            debug!("resuming session {}", resume.session_id);
                            Frame::resume(self.token.expose(), &resume.session_id, seq)
                        }
                        _ => {
                            debug!("identifying");
                            Frame::identify(self.token.expose(), &self.properties)
                        }
                    };
                    Step::Handshake { interval, reply }
                }
                Err(e) => {
                    warn!("ignoring malformed HELLO: {e}");
                    Step::Continue
                }
            },
            Opcode::Reconnect => {
                debug!("server requested reconnect");
                Step::Reconnect { resume: true }
            }
            Opcode::InvalidSession => {
                debug!("server invalidated session");
                self.invalidate();
                Step::Reconnect { resume: false }
            }
            Opcode::Dispatch if frame.is_event(EVENT_READY) => match frame.payload::<Ready>() {
                Ok(ready) => {
                    self.ready = true;
                    self.resume = Some(ResumeState {
                        session_id: ready.session_id,
                        gateway_url: ready.resume_gateway_url,
                    });
                    Step::Ready
                }
                Err(e) => {
                    warn!("ignoring malformed READY: {e}");
                    Step::Continue
                }
            },
            // A successful RESUME is acknowledged with RESUMED, not READY;
            // the cached session and resume URL stay as they are.
            Opcode::Dispatch if frame.is_event(EVENT_RESUMED) => {
                debug!("session resumed");
                self.ready = true;
                Step::Ready
            }
            _ => Step::Continue,
        }
    }

    /// Discards the cached session, sequence and resume URL; the next
    /// handshake identifies afresh from the well-known URL.
    fn invalidate(&mut self) {
        self.resume = None;
        self.last_seq = None;
        self.ready = false;
    }

    fn mark_disconnected(&mut self) {
        self.ready = false;
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WebsocketMessage>;

enum Drive {
    Shutdown,
    Reconnect { cooldown: Option<Duration> },
}

/// The per-connection I/O task: connects, drives the socket, reconnects.
struct Runner {
    settings: Settings,
    machine: Machine,
    ready: Arc<AtomicBool>,
    on_ready: ReadyHook,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
}

impl Runner {
    async fn run(mut self) {
        loop {
            let url = self.machine.connect_url(&self.settings.url);
            let stream = tokio::select! {
                () = self.shutdown.cancelled() => return,
                result = tokio_tungstenite::connect_async(url.as_str()) => match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("gateway connect to {url} failed: {e}");
                        // Jittered so a fleet of connections does not retry
                        // in lockstep.
                        let delay = self
                            .settings
                            .connect_retry_delay
                            .mul_f32(1.0 + fastrand::f32());
                        tokio::select! {
                            () = self.shutdown.cancelled() => return,
                            () = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };
            debug!("gateway socket open");

            match self.drive(stream).await {
                Drive::Shutdown => return,
                Drive::Reconnect { cooldown } => {
                    self.ready.store(false, Ordering::Release);
                    self.machine.mark_disconnected();
                    if let Some(cooldown) = cooldown {
                        tokio::select! {
                            () = self.shutdown.cancelled() => return,
                            () = tokio::time::sleep(cooldown) => {}
                        }
                    }
                }
            }
        }
    }

    /// Drives one socket until shutdown or a reconnect condition.
    async fn drive(&mut self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Drive {
        let (mut ws_tx, mut ws_rx) = stream.split();

        // Dormant until HELLO sets the interval; the first beat lands at a
        // random point within the interval so connections sharing a process
        // do not beat in lockstep.
        let heartbeat = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(heartbeat);
        let mut beat_every: Option<Duration> = None;

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    let _ = ws_tx.send(WebsocketMessage::Close(None)).await;
                    return Drive::Shutdown;
                }

                () = &mut heartbeat, if beat_every.is_some() => {
                    if let Some(every) = beat_every {
                        trace!("heartbeat");
                        if let Err(e) = send_frame(&mut ws_tx, &self.machine.heartbeat()).await {
                            warn!("heartbeat failed: {e}");
                            return Drive::Reconnect { cooldown: None };
                        }
                        heartbeat.as_mut().reset(tokio::time::Instant::now() + every);
                    }
                }

                command = self.commands.recv() => match command {
                    // Readiness is re-checked here: a command may have been
                    // queued just as the connection dropped.
                    Some(command) => if self.machine.is_ready() {
                        let update = match command {
                            Command::Presence(activities) => PresenceUpdate::active(activities),
                            Command::Clear => PresenceUpdate::clear(),
                        };
                        if let Err(e) = send_frame(&mut ws_tx, &Frame::presence(&update)).await {
                            warn!("presence update failed: {e}");
                            return Drive::Reconnect { cooldown: None };
                        }
                    },
                    None => {
                        let _ = ws_tx.send(WebsocketMessage::Close(None)).await;
                        return Drive::Shutdown;
                    }
                },

                message = ws_rx.next() => match message {
                    Some(Ok(WebsocketMessage::Text(text))) => {
                        match serde_json::from_str::<Frame>(text.as_str()) {
                            Ok(frame) => {
                                trace!("frame: op {:?}, event {:?}, seq {:?}", frame.op, frame.t, frame.s);
                                match self.machine.handle_frame(&frame) {
                                    Step::Continue => {}
                                    Step::Handshake { interval, reply } => {
                                        if let Err(e) = send_frame(&mut ws_tx, &reply).await {
                                            warn!("handshake failed: {e}");
                                            return Drive::Reconnect { cooldown: None };
                                        }
                                        let first = interval.mul_f32(fastrand::f32());
                                        heartbeat.as_mut().reset(tokio::time::Instant::now() + first);
                                        beat_every = Some(interval);
                                    }
                                    Step::Ready => {
                                        info!("gateway ready");
                                        self.ready.store(true, Ordering::Release);
                                        (self.on_ready)();
                                    }
                                    Step::Reconnect { resume } => {
                                        let cooldown = (!resume)
                                            .then_some(self.settings.invalid_session_cooldown);
                                        return Drive::Reconnect { cooldown };
                                    }
                                }
                            }
                            Err(e) => warn!("ignoring malformed frame: {e}"),
                        }
                    }
                    Some(Ok(WebsocketMessage::Close(close))) => {
                        debug!("gateway closed the connection: {close:?}");
                        return Drive::Reconnect { cooldown: None };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket error: {e}");
                        return Drive::Reconnect { cooldown: None };
                    }
                    None => return Drive::Reconnect { cooldown: None },
                },
            }
        }
    }
}

async fn send_frame(tx: &mut WsSink, frame: &Frame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    tx.send(WebsocketMessage::Text(text.into()))
        .await
        .map_err(Into::into)
}
