//! Connection supervisor wiring the [`SyncEngine`] to a boardsync server.
//!
//! [`spawn_net`] opens the live channel, then hands the connection to a
//! background task that owns the engine. Callers talk to it through
//! [`NetCommand`] / [`NetEvent`] channels and read the current board from a
//! shared [`ClientView`].
//!
//! # Architecture
//!
//! ```text
//! caller  ─── NetCommand ──→  supervisor ──→ WebSocket sink
//!         ←── NetEvent ─────  (SyncEngine) ←── reader task ←── WebSocket stream
//!         ←── ClientView ───
//! ```
//!
//! When the socket drops, the supervisor keeps accepting local edits (they
//! queue in the engine), reconnects with exponential backoff, and on the new
//! `Hello` resends everything pending and catches up if it fell behind.
//! A client that has never synced starts from a snapshot at the head.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use boardsync_proto::codec::CodecError;
use boardsync_proto::live::{self, AwarenessEntry, ClientMessage, Peer, ServerMessage};
use boardsync_proto::{BoardState, Column, OpKind, TaskField, position_between};

use crate::config::{ReconnectConfig, backoff_delay};
use crate::engine::{Effect, SyncEngine, SyncStatus};
use crate::presence::{Roster, color_for};
use crate::throttle::{DeltaThrottle, Draft};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Errors from the connection layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The configured server URL is unusable.
    #[error("invalid server url {url}: {reason}")]
    InvalidUrl {
        /// The URL as configured.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Nothing is listening at the server address.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The WebSocket handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server refused the `Join`.
    #[error("server refused to join: {0}")]
    Refused(String),

    /// A connection step did not finish in time.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// The connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Commands from the caller to the supervisor.
#[derive(Debug)]
pub enum NetCommand {
    /// Apply a board mutation locally and submit it.
    Mutate(OpKind),
    /// Report the local caret in a task.
    Aware {
        /// Task being edited.
        task_id: String,
        /// Selection start.
        caret_start: u32,
        /// Selection end.
        caret_end: u32,
    },
    /// Focus left the task being edited.
    Blur,
    /// Share an uncommitted draft. Throttled per task.
    Delta {
        /// Task being edited.
        task_id: String,
        /// Field being edited.
        field: TaskField,
        /// Draft value.
        value: String,
    },
    /// Retry connecting now, after the supervisor gave up.
    Reconnect,
    /// Close the connection and stop.
    Shutdown,
}

/// Notifications from the supervisor to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// Connection state changed.
    ConnectionStatus {
        /// Whether a session is established.
        connected: bool,
    },
    /// A reconnect attempt is about to start.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Attempts before giving up.
        max_attempts: u32,
    },
    /// All reconnect attempts failed. Send [`NetCommand::Reconnect`] to retry.
    ReconnectFailed,
    /// A session was established.
    Welcome {
        /// The authenticated user.
        you: Peer,
        /// Other users online.
        online: Vec<Peer>,
        /// The workspace head at join time.
        maxseq: u64,
    },
    /// The visible board changed.
    BoardChanged {
        /// Confirmed sequence after the change.
        last_seq: u64,
    },
    /// The sync status changed.
    StatusChanged(SyncStatus),
    /// A catch-up response was installed.
    CaughtUp {
        /// Confirmed sequence after the install.
        last_seq: u64,
        /// `true` for a snapshot install, `false` for an op range.
        from_snapshot: bool,
    },
    /// A local mutation was applied optimistically.
    Applied {
        /// Its operation id.
        op_id: String,
    },
    /// A local mutation is now part of the confirmed board.
    Committed {
        /// Its operation id.
        op_id: String,
    },
    /// A local mutation was refused and rolled back.
    Rejected {
        /// Its operation id.
        op_id: String,
        /// The server's reason.
        reason: String,
    },
    /// A user came online.
    PresenceJoined(Peer),
    /// A user went offline.
    PresenceLeft {
        /// The user that left.
        user_id: String,
    },
    /// Awareness entries changed.
    Awareness(Vec<AwarenessEntry>),
    /// Another user's uncommitted draft.
    Delta {
        /// User typing.
        by: String,
        /// Task being edited.
        task_id: String,
        /// Field being edited.
        field: TaskField,
        /// Draft value.
        value: String,
    },
    /// An error worth showing to the user.
    Error(String),
}

/// Snapshot of client state, refreshed by the supervisor.
#[derive(Debug, Clone)]
pub struct ClientView {
    /// Visible board, including pending local edits.
    pub board: BoardState,
    /// Confirmed sequence.
    pub last_seq: u64,
    /// Local operations not yet confirmed.
    pub pending: usize,
    /// Trust level of `board`.
    pub status: SyncStatus,
    /// Online users and awareness.
    pub roster: Roster,
}

impl ClientView {
    /// Ordering key that places a task at the end of `column` in `tab`.
    #[must_use]
    pub fn end_position(&self, tab: &str, column: Column) -> f64 {
        let last = self
            .board
            .tab(tab)
            .and_then(|t| t.column(column).last())
            .map(|t| t.pos);
        position_between(last, None)
    }
}

impl Default for ClientView {
    fn default() -> Self {
        Self {
            board: BoardState::new(),
            last_seq: 0,
            pending: 0,
            status: SyncStatus::Offline,
            roster: Roster::default(),
        }
    }
}

/// Shared, read-mostly client state.
pub type SharedView = Arc<RwLock<ClientView>>;

/// Configuration for the networking layer.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9000`.
    pub server_url: String,
    /// Workspace to join.
    pub workspace: String,
    /// Bearer token.
    pub token: String,
    /// Timeout for the handshake and the `Hello`.
    pub connect_timeout: Duration,
    /// Time to wait for a catch-up response before asking again.
    pub sync_timeout: Duration,
    /// Minimum spacing of live text deltas per task.
    pub delta_interval: Duration,
    /// Capacity of the command, event and inbound frame channels.
    pub channel_capacity: usize,
    /// Reconnect behavior.
    pub reconnect: ReconnectConfig,
}

impl NetConfig {
    /// Creates a `NetConfig` with default timeouts.
    #[must_use]
    pub fn new(server_url: String, workspace: String, token: String) -> Self {
        Self {
            server_url,
            workspace,
            token,
            connect_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(10),
            delta_interval: Duration::from_millis(60),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// The live-channel endpoint: `<server>/live?workspace=<id>`.
    ///
    /// `http` and `https` are accepted and mapped to `ws` and `wss`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::InvalidUrl`] if the URL does not parse or uses
    /// another scheme.
    pub fn live_url(&self) -> Result<Url, NetError> {
        let invalid = |reason: String| NetError::InvalidUrl {
            url: self.server_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid("cannot change scheme".into()))?;
        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/live");
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("workspace", &self.workspace);
        Ok(url)
    }
}

/// Handles returned by [`spawn_net`].
#[derive(Debug)]
pub struct NetHandle {
    /// Send commands to the supervisor.
    pub commands: mpsc::Sender<NetCommand>,
    /// Receive notifications.
    pub events: mpsc::Receiver<NetEvent>,
    /// Current client state.
    pub view: SharedView,
}

/// The server's `Hello`.
#[derive(Debug)]
struct Welcome {
    you: Peer,
    online: Vec<Peer>,
    awareness: Vec<AwarenessEntry>,
    maxseq: u64,
}

/// An established, joined connection.
struct Session {
    sender: WsSender,
    reader: WsReader,
    welcome: Welcome,
}

/// Connects, joins the workspace, and spawns the supervisor.
///
/// The first connection is made before returning so that a bad URL, an
/// unreachable server or a refused token surface to the caller instead of
/// turning into reconnect attempts.
///
/// # Errors
///
/// Returns [`NetError`] if the first connection or join fails.
pub async fn spawn_net(config: NetConfig) -> Result<NetHandle, NetError> {
    let url = config.live_url()?;
    let session = connect(&config, &url).await?;
    tracing::info!(workspace = %config.workspace, user = %session.welcome.you.user_id, "joined workspace");

    let (cmd_tx, cmd_rx) = mpsc::channel::<NetCommand>(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel::<NetEvent>(config.channel_capacity);
    let view: SharedView = Arc::new(RwLock::new(ClientView::default()));

    let supervisor = Supervisor {
        engine: SyncEngine::new(session.welcome.you.user_id.clone()),
        throttle: DeltaThrottle::new(config.delta_interval),
        config,
        url,
        cmd_rx,
        evt_tx,
        view: Arc::clone(&view),
        status: SyncStatus::Offline,
        revision: 0,
    };
    tokio::spawn(supervisor.run(session));

    Ok(NetHandle {
        commands: cmd_tx,
        events: evt_rx,
        view,
    })
}

/// How a connected phase ended.
enum SessionEnd {
    Lost { uptime: Duration },
    Shutdown,
}

/// How an offline phase ended.
enum Offline {
    Connected(Session),
    GaveUp,
    Shutdown,
}

/// Outstanding catch-up request timing.
#[derive(Default)]
struct SyncTimer {
    deadline: Option<Instant>,
    attempt: u32,
}

struct Supervisor {
    config: NetConfig,
    url: Url,
    engine: SyncEngine,
    throttle: DeltaThrottle,
    cmd_rx: mpsc::Receiver<NetCommand>,
    evt_tx: mpsc::Sender<NetEvent>,
    view: SharedView,
    status: SyncStatus,
    revision: u64,
}

impl Supervisor {
    async fn run(mut self, first: Session) {
        let mut session = first;
        // Attempts already spent on a flapping connection.
        let mut spent = 0;
        loop {
            let SessionEnd::Lost { uptime } = self.connected(session).await else {
                break;
            };
            self.engine.on_disconnect();
            self.throttle.clear();
            self.view.write().roster.clear();
            self.publish();
            self.emit(NetEvent::ConnectionStatus { connected: false });
            tracing::warn!(workspace = %self.config.workspace, ?uptime, "connection lost");

            if uptime >= self.config.reconnect.stability_threshold {
                spent = 0;
            }
            session = loop {
                match self.reconnect(&mut spent).await {
                    Offline::Connected(s) => break s,
                    Offline::Shutdown => return,
                    Offline::GaveUp => {
                        self.emit(NetEvent::ReconnectFailed);
                        if !self.idle().await {
                            return;
                        }
                        spent = 0;
                    }
                }
            };
        }
        tracing::info!(workspace = %self.config.workspace, "net supervisor stopped");
    }

    /// Drives one session until it drops or the caller shuts down.
    async fn connected(&mut self, session: Session) -> SessionEnd {
        let Session {
            mut sender,
            reader,
            welcome,
        } = session;
        let started = Instant::now();
        let (in_tx, mut in_rx) = mpsc::channel(self.config.channel_capacity);
        let reader_task = tokio::spawn(reader_loop(reader, in_tx));
        let mut sync = SyncTimer::default();

        let effects = self
            .engine
            .on_hello(welcome.you.user_id.clone(), welcome.maxseq);
        self.view
            .write()
            .roster
            .reset(welcome.you.clone(), welcome.online.clone(), welcome.awareness);
        self.emit(NetEvent::ConnectionStatus { connected: true });
        self.emit(NetEvent::Welcome {
            you: welcome.you,
            online: welcome.online,
            maxseq: welcome.maxseq,
        });

        let mut ticker = tokio::time::interval(self.config.delta_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut outcome = self.execute(&mut sender, effects, &mut sync).await;
        while outcome.is_ok() {
            outcome = tokio::select! {
                msg = in_rx.recv() => match msg {
                    Some(msg) => {
                        let effects = self.on_server_message(msg);
                        self.execute(&mut sender, effects, &mut sync).await
                    }
                    None => Err(NetError::ConnectionClosed),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(NetCommand::Shutdown) => {
                        let _ = sender.close().await;
                        reader_task.abort();
                        return SessionEnd::Shutdown;
                    }
                    Some(cmd) => self.on_command(&mut sender, cmd, &mut sync).await,
                },
                () = tokio::time::sleep_until(sync.deadline.unwrap_or_else(Instant::now)),
                    if sync.deadline.is_some() =>
                {
                    tracing::warn!(attempt = sync.attempt, "catch-up timed out, retrying");
                    let effects = self.engine.retry_sync();
                    self.execute(&mut sender, effects, &mut sync).await
                }
                _ = ticker.tick(), if self.throttle.has_waiting() => {
                    let drafts = self.throttle.due(Instant::now());
                    send_drafts(&mut sender, drafts).await
                }
            };
        }

        if let Err(e) = outcome {
            tracing::debug!(error = %e, "session ended");
        }
        reader_task.abort();
        SessionEnd::Lost {
            uptime: started.elapsed(),
        }
    }

    /// Backoff loop. Local edits keep queueing between attempts.
    async fn reconnect(&mut self, spent: &mut u32) -> Offline {
        let max_attempts = self.config.reconnect.max_attempts;
        while *spent < max_attempts {
            *spent += 1;
            let attempt = *spent;
            self.emit(NetEvent::Reconnecting {
                attempt,
                max_attempts,
            });
            let delay = self.config.reconnect.delay_for(attempt);
            if !self.offline_for(Some(delay)).await {
                return Offline::Shutdown;
            }

            match connect(&self.config, &self.url).await {
                Ok(session) => {
                    tracing::info!(attempt, "reconnected");
                    return Offline::Connected(session);
                }
                Err(NetError::Refused(reason)) => {
                    tracing::warn!(%reason, "server refused to rejoin");
                    self.emit(NetEvent::Error(format!("server refused to rejoin: {reason}")));
                    return Offline::GaveUp;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
        Offline::GaveUp
    }

    /// Waits offline until the caller asks for a reconnect. Returns `false`
    /// on shutdown.
    async fn idle(&mut self) -> bool {
        self.offline_for(None).await
    }

    /// Serves commands without a connection for `delay` (or until a
    /// [`NetCommand::Reconnect`]). Returns `false` on shutdown.
    async fn offline_for(&mut self, delay: Option<Duration>) -> bool {
        let sleep = tokio::time::sleep(delay.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep, if delay.is_some() => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(NetCommand::Shutdown) => return false,
                    Some(NetCommand::Reconnect) => return true,
                    Some(NetCommand::Mutate(kind)) => {
                        if self.engine.pending_len() >= self.config.reconnect.message_queue_cap {
                            self.emit(NetEvent::Error("offline queue full, edit discarded".into()));
                            continue;
                        }
                        let (op_id, effects) = self.engine.local(kind);
                        debug_assert!(effects.is_empty());
                        self.emit(NetEvent::Applied { op_id });
                        self.publish();
                    }
                    Some(_) => {}
                },
            }
        }
    }

    async fn on_command(
        &mut self,
        sender: &mut WsSender,
        cmd: NetCommand,
        sync: &mut SyncTimer,
    ) -> Result<(), NetError> {
        match cmd {
            NetCommand::Mutate(kind) => {
                let (op_id, effects) = self.engine.local(kind);
                self.emit(NetEvent::Applied { op_id });
                self.execute(sender, effects, sync).await
            }
            NetCommand::Aware {
                task_id,
                caret_start,
                caret_end,
            } => {
                let color = color_for(self.engine.client_id()).to_string();
                send(
                    sender,
                    &ClientMessage::AwareUpdate {
                        task_id,
                        caret_start,
                        caret_end,
                        color,
                    },
                )
                .await
            }
            NetCommand::Blur => send(sender, &ClientMessage::AwareBlur).await,
            NetCommand::Delta {
                task_id,
                field,
                value,
            } => {
                let draft = Draft {
                    task_id,
                    field,
                    value,
                };
                match self.throttle.offer(draft, Instant::now()) {
                    Some(draft) => send_drafts(sender, vec![draft]).await,
                    None => Ok(()),
                }
            }
            NetCommand::Reconnect | NetCommand::Shutdown => Ok(()),
        }
    }

    fn on_server_message(&mut self, msg: ServerMessage) -> Vec<Effect> {
        match msg {
            ServerMessage::Op(entry) => {
                tracing::debug!(seq = entry.seq, op_id = %entry.op.op_id, kind = entry.op.kind.name(), "op");
                self.engine.on_op(&entry)
            }
            ServerMessage::Accepted { op_id, seq } => self.engine.on_accepted(&op_id, seq),
            ServerMessage::Rejected { op_id, reason } => {
                tracing::warn!(%op_id, %reason, "operation rejected");
                self.engine.on_rejected(&op_id, &reason)
            }
            ServerMessage::Sync(response) => {
                tracing::debug!(high_water = response.high_water(), "catch-up response");
                self.engine.on_sync(response)
            }
            ServerMessage::PresenceJoin(peer) => {
                self.view.write().roster.join(peer.clone());
                self.emit(NetEvent::PresenceJoined(peer));
                Vec::new()
            }
            ServerMessage::PresenceLeave { user_id } => {
                self.view.write().roster.leave(&user_id);
                self.emit(NetEvent::PresenceLeft { user_id });
                Vec::new()
            }
            ServerMessage::AwareState { entries } => {
                self.view.write().roster.set_awareness(entries.clone());
                self.emit(NetEvent::Awareness(entries));
                Vec::new()
            }
            ServerMessage::Delta {
                by,
                task_id,
                field,
                value,
            } => {
                self.emit(NetEvent::Delta {
                    by,
                    task_id,
                    field,
                    value,
                });
                Vec::new()
            }
            ServerMessage::Error { reason } => {
                tracing::warn!(%reason, "server error");
                self.emit(NetEvent::Error(reason));
                Vec::new()
            }
            ServerMessage::Hello { .. } => {
                tracing::debug!("unexpected hello mid-session");
                Vec::new()
            }
        }
    }

    /// Carries out engine effects, then refreshes the shared view.
    async fn execute(
        &mut self,
        sender: &mut WsSender,
        effects: Vec<Effect>,
        sync: &mut SyncTimer,
    ) -> Result<(), NetError> {
        let mut result = Ok(());
        for effect in effects {
            match effect {
                Effect::Transmit(op) => {
                    if result.is_ok() {
                        result = send(sender, &ClientMessage::Submit { op }).await;
                    }
                }
                Effect::RequestSync { since } => {
                    self.arm_sync_timer(sync);
                    if result.is_ok() {
                        result = send(sender, &ClientMessage::SyncRequest { since }).await;
                    }
                }
                Effect::RequestSnapshot => {
                    self.arm_sync_timer(sync);
                    if result.is_ok() {
                        result = send(sender, &ClientMessage::SnapshotRequest).await;
                    }
                }
                Effect::CaughtUp {
                    last_seq,
                    from_snapshot,
                } => {
                    tracing::debug!(last_seq, from_snapshot, "caught up");
                    self.emit(NetEvent::CaughtUp {
                        last_seq,
                        from_snapshot,
                    });
                }
                Effect::Confirmed { op_id } => self.emit(NetEvent::Committed { op_id }),
                Effect::Dropped { op_id, reason } => {
                    self.emit(NetEvent::Rejected { op_id, reason });
                }
            }
        }
        if !self.engine.is_syncing() {
            *sync = SyncTimer::default();
        }
        self.publish();
        result
    }

    fn arm_sync_timer(&self, sync: &mut SyncTimer) {
        sync.attempt += 1;
        let cap = self.config.reconnect.max_delay.max(self.config.sync_timeout);
        sync.deadline = Some(Instant::now() + backoff_delay(self.config.sync_timeout, cap, sync.attempt));
    }

    /// Copies engine state into the shared view and announces changes.
    fn publish(&mut self) {
        {
            let mut view = self.view.write();
            view.board = self.engine.board().clone();
            view.last_seq = self.engine.last_seq();
            view.pending = self.engine.pending_len();
            view.status = self.engine.status();
        }
        if self.engine.revision() != self.revision {
            self.revision = self.engine.revision();
            self.emit(NetEvent::BoardChanged {
                last_seq: self.engine.last_seq(),
            });
        }
        if self.engine.status() != self.status {
            self.status = self.engine.status();
            self.emit(NetEvent::StatusChanged(self.status));
        }
    }

    fn emit(&self, event: NetEvent) {
        if let Err(e) = self.evt_tx.try_send(event) {
            tracing::debug!(error = %e, "net event dropped");
        }
    }
}

/// Opens the socket, sends `Join`, and waits for `Hello`.
async fn connect(config: &NetConfig, url: &Url) -> Result<Session, NetError> {
    let (ws, _response) = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    .map_err(|_| NetError::Timeout("connect"))?
    .map_err(map_ws_connect_error)?;

    let (mut sender, mut reader) = ws.split();
    send(
        &mut sender,
        &ClientMessage::Join {
            workspace: config.workspace.clone(),
            token: config.token.clone(),
        },
    )
    .await?;

    let welcome = tokio::time::timeout(config.connect_timeout, wait_for_hello(&mut reader))
        .await
        .map_err(|_| NetError::Timeout("join"))??;
    Ok(Session {
        sender,
        reader,
        welcome,
    })
}

async fn wait_for_hello(reader: &mut WsReader) -> Result<Welcome, NetError> {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Binary(data)) => match live::decode_server(&data)? {
                ServerMessage::Hello {
                    you,
                    online,
                    awareness,
                    maxseq,
                } => {
                    return Ok(Welcome {
                        you,
                        online,
                        awareness,
                        maxseq,
                    });
                }
                ServerMessage::Error { reason } => return Err(NetError::Refused(reason)),
                other => tracing::debug!(?other, "frame before hello ignored"),
            },
            Ok(Message::Close(_)) => return Err(NetError::ConnectionClosed),
            Ok(_) => {}
            Err(e) => return Err(NetError::Io(std::io::Error::other(e))),
        }
    }
    Err(NetError::ConnectionClosed)
}

/// Background task that decodes server frames into `tx`.
///
/// Malformed frames are logged and skipped. Returns when the socket closes,
/// errors, or the receiver is dropped.
async fn reader_loop(mut reader: WsReader, tx: mpsc::Sender<ServerMessage>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Binary(data)) => match live::decode_server(&data) {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed server frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("server closed the live channel");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "live channel read error");
                break;
            }
        }
    }
}

async fn send(sender: &mut WsSender, msg: &ClientMessage) -> Result<(), NetError> {
    let bytes = live::encode_client(msg)?;
    sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "live channel send failed");
            NetError::ConnectionClosed
        })
}

async fn send_drafts(sender: &mut WsSender, drafts: Vec<Draft>) -> Result<(), NetError> {
    for draft in drafts {
        send(
            sender,
            &ClientMessage::Delta {
                task_id: draft.task_id,
                field: draft.field,
                value: draft.value,
            },
        )
        .await?;
    }
    Ok(())
}

/// Map a `tokio_tungstenite` connection error to a [`NetError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> NetError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            NetError::Unreachable(io_err.to_string())
        }
        WsError::Io(io_err) => NetError::Io(io_err),
        WsError::Http(response) => {
            NetError::Handshake(format!("HTTP status {}", response.status()))
        }
        other => NetError::Handshake(other.to_string()),
    }
}
