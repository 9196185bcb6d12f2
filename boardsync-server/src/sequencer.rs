//! Per-workspace sequencer actor.
//!
//! Each workspace gets one sequencer task that owns everything mutable
//! about the workspace: the sequence counter, the connected sessions, the
//! presence set and the awareness table. All requests arrive as commands
//! on an unbounded channel and are handled strictly one at a time, so appends
//! are totally ordered without any locking.
//!
//! Append pipeline:
//! 1. Validate the operation (nothing is persisted on failure).
//! 2. Insert under the `op_id` uniqueness key with `seq = head + 1`.
//!    A duplicate reports the existing `seq`.
//! 3. Reply to the submitter.
//! 4. Broadcast `{seq, op}` to every session (new entries only).
//! 5. Compact when `seq` is a multiple of the compaction interval.
//!
//! A sequencer with no sessions retires after `idle_timeout` without
//! commands; the hub starts a fresh one on the next lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use boardsync_proto::live::{AwarenessEntry, Peer, ServerMessage, SyncResponse};
use boardsync_proto::op::{LogEntry, OpError, Operation, Snapshot, TaskField, now_millis};
use boardsync_proto::replay;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::storage::{InsertOutcome, Storage, StorageError};

/// Entries fetched per storage read while replaying.
const REPLAY_PAGE: usize = 512;

/// Tunables for a sequencer.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Compact when `seq % compaction_interval == 0`.
    pub compaction_interval: u64,
    /// Largest gap served as an op range; beyond it a snapshot is sent.
    pub sync_window: u64,
    /// Awareness entries idle longer than this are dropped.
    pub awareness_ttl: Duration,
    /// Minimum spacing between live deltas from one session.
    pub delta_min_interval: Duration,
    /// How long a sequencer with no sessions waits for a command before
    /// retiring.
    pub idle_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            compaction_interval: 1500,
            sync_window: 1500,
            awareness_ttl: Duration::from_millis(8000),
            delta_min_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Unique identifier for one live-channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new time-ordered session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced to callers of a sequencer.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    /// The operation failed ingress validation.
    #[error("operation rejected: {0}")]
    Rejected(#[from] OpError),
    /// The backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The actor task is gone.
    #[error("sequencer for workspace {0} is not running")]
    Unavailable(String),
}

/// Outbound channel of one session; the socket writer drains it.
pub type SessionSender = mpsc::UnboundedSender<ServerMessage>;

/// Where a result should be delivered.
enum Reply<T> {
    /// Into the originating session's outbound channel, in order with
    /// broadcasts.
    Session(SessionId),
    /// To an awaiting caller (HTTP handlers).
    Caller(oneshot::Sender<Result<T, SequencerError>>),
}

/// Requests handled by the actor.
enum Command {
    Append {
        op: Operation,
        reply: Reply<u64>,
    },
    Sync {
        since: u64,
        reply: Reply<SyncResponse>,
    },
    Snapshot {
        reply: Reply<Snapshot>,
    },
    Join {
        session: SessionId,
        peer: Peer,
        sender: SessionSender,
    },
    Leave {
        session: SessionId,
    },
    AwareUpdate {
        session: SessionId,
        task_id: String,
        caret_start: u32,
        caret_end: u32,
        color: String,
    },
    AwareBlur {
        session: SessionId,
    },
    Delta {
        session: SessionId,
        task_id: String,
        field: TaskField,
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle to a running sequencer.
#[derive(Clone)]
pub struct SequencerHandle {
    workspace: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SequencerHandle {
    /// Workspace this sequencer serves.
    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Returns `true` once the actor has stopped taking commands.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, cmd: Command) -> Result<(), SequencerError> {
        self.tx
            .send(cmd)
            .map_err(|_| SequencerError::Unavailable(self.workspace.to_string()))
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, SequencerError>>) -> Command,
    ) -> Result<T, SequencerError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| SequencerError::Unavailable(self.workspace.to_string()))?
    }

    /// Appends `op` and returns its sequence (the existing one for a
    /// duplicate `op_id`).
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError`] if the op is invalid, storage fails, or the
    /// actor is gone.
    pub async fn append(&self, op: Operation) -> Result<u64, SequencerError> {
        self.ask(|tx| Command::Append {
            op,
            reply: Reply::Caller(tx),
        })
        .await
    }

    /// Appends `op` on behalf of a session; the outcome arrives on the
    /// session's channel as `Accepted` or `Rejected`.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn submit(&self, session: SessionId, op: Operation) -> Result<(), SequencerError> {
        self.send(Command::Append {
            op,
            reply: Reply::Session(session),
        })
    }

    /// Catch-up query.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError`] if storage fails or the actor is gone.
    pub async fn sync(&self, since: u64) -> Result<SyncResponse, SequencerError> {
        self.ask(|tx| Command::Sync {
            since,
            reply: Reply::Caller(tx),
        })
        .await
    }

    /// Catch-up on behalf of a session; the response is queued on the
    /// session's channel behind every op broadcast it covers.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn request_sync(&self, session: SessionId, since: u64) -> Result<(), SequencerError> {
        self.send(Command::Sync {
            since,
            reply: Reply::Session(session),
        })
    }

    /// Board state materialized at the current head.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError`] if storage fails or the actor is gone.
    pub async fn snapshot(&self) -> Result<Snapshot, SequencerError> {
        self.ask(|tx| Command::Snapshot {
            reply: Reply::Caller(tx),
        })
        .await
    }

    /// Cold-start snapshot on behalf of a session, answered as a
    /// snapshot-mode `Sync` queued behind every op broadcast it covers.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn request_snapshot(&self, session: SessionId) -> Result<(), SequencerError> {
        self.send(Command::Snapshot {
            reply: Reply::Session(session),
        })
    }

    /// Registers a session. `Hello` is queued on `sender` before any
    /// broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn join(
        &self,
        session: SessionId,
        peer: Peer,
        sender: SessionSender,
    ) -> Result<(), SequencerError> {
        self.send(Command::Join {
            session,
            peer,
            sender,
        })
    }

    /// Unregisters a session. Errors are ignored; a stopped actor has no
    /// sessions to clean up.
    pub fn leave(&self, session: SessionId) {
        let _ = self.send(Command::Leave { session });
    }

    /// Records the session user's caret position.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn aware_update(
        &self,
        session: SessionId,
        task_id: String,
        caret_start: u32,
        caret_end: u32,
        color: String,
    ) -> Result<(), SequencerError> {
        self.send(Command::AwareUpdate {
            session,
            task_id,
            caret_start,
            caret_end,
            color,
        })
    }

    /// Clears the session user's awareness entry.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn aware_blur(&self, session: SessionId) -> Result<(), SequencerError> {
        self.send(Command::AwareBlur { session })
    }

    /// Relays a live text delta to the other sessions.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Unavailable`] if the actor is gone.
    pub fn delta(
        &self,
        session: SessionId,
        task_id: String,
        field: TaskField,
        value: String,
    ) -> Result<(), SequencerError> {
        self.send(Command::Delta {
            session,
            task_id,
            field,
            value,
        })
    }
}

/// Starts the sequencer for `workspace`, reading the log head from storage.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns [`StorageError`] if the log head cannot be read.
pub fn spawn(
    workspace: &str,
    storage: Arc<dyn Storage>,
    config: SequencerConfig,
) -> Result<SequencerHandle, StorageError> {
    let head = off_worker(&*storage, |s| s.max_seq(workspace))?;
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = Sequencer {
        workspace: workspace.to_string(),
        storage,
        config,
        head,
        sessions: HashMap::new(),
        awareness: HashMap::new(),
    };
    tracing::info!(workspace = %workspace, head, "sequencer started");
    tokio::spawn(actor.run(rx));
    Ok(SequencerHandle {
        workspace: Arc::from(workspace),
        tx,
    })
}

/// Runs a storage call, handing the worker's other tasks to another thread
/// first when the backend blocks on I/O.
///
/// `block_in_place` is unavailable on a current-thread runtime; there the
/// call runs inline.
fn off_worker<T>(storage: &dyn Storage, f: impl FnOnce(&dyn Storage) -> T) -> T {
    let multi_thread = Handle::try_current()
        .is_ok_and(|rt| rt.runtime_flavor() == RuntimeFlavor::MultiThread);
    if storage.blocks_on_io() && multi_thread {
        tokio::task::block_in_place(|| f(storage))
    } else {
        f(storage)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Session {
    peer: Peer,
    sender: SessionSender,
    last_delta: Option<Instant>,
}

struct Awareness {
    entry: AwarenessEntry,
    touched: Instant,
}

/// Outcome of an append that passed validation.
enum Appended {
    New(LogEntry),
    Duplicate(u64),
}

struct Sequencer {
    workspace: String,
    storage: Arc<dyn Storage>,
    config: SequencerConfig,
    /// Highest assigned sequence.
    head: u64,
    sessions: HashMap<SessionId, Session>,
    /// Keyed by user id.
    awareness: HashMap<String, Awareness>,
}

impl Sequencer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next = if self.sessions.is_empty() {
                tokio::time::timeout(self.config.idle_timeout, rx.recv()).await
            } else {
                Ok(rx.recv().await)
            };
            match next {
                Ok(Some(cmd)) => self.handle(cmd),
                Ok(None) => break,
                Err(_) => {
                    // Refuse new commands, then finish the ones already queued.
                    rx.close();
                    while let Ok(cmd) = rx.try_recv() {
                        self.handle(cmd);
                    }
                    tracing::info!(workspace = %self.workspace, head = self.head, "sequencer idle, retiring");
                    break;
                }
            }
        }
        tracing::info!(workspace = %self.workspace, "sequencer stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Append { op, reply } => self.handle_append(op, reply),
            Command::Sync { since, reply } => {
                let result = self.sync(since);
                self.reply_sync(reply, result, std::convert::identity);
            }
            Command::Snapshot { reply } => {
                let result = self.materialize();
                self.reply_sync(reply, result, SyncResponse::Snapshot);
            }
            Command::Join {
                session,
                peer,
                sender,
            } => self.join(session, peer, sender),
            Command::Leave { session } => self.leave(session),
            Command::AwareUpdate {
                session,
                task_id,
                caret_start,
                caret_end,
                color,
            } => self.aware_update(session, task_id, caret_start, caret_end, color),
            Command::AwareBlur { session } => self.aware_blur(session),
            Command::Delta {
                session,
                task_id,
                field,
                value,
            } => self.delta(session, task_id, field, value),
        }
    }

    // --- Durable path ---

    fn io<T>(&self, f: impl FnOnce(&dyn Storage) -> T) -> T {
        off_worker(&*self.storage, f)
    }

    fn append(&mut self, mut op: Operation) -> Result<Appended, SequencerError> {
        op.validate()?;
        op.normalize();
        let entry = LogEntry {
            seq: self.head + 1,
            op,
        };
        match self.io(|s| s.insert_entry(&self.workspace, &entry))? {
            InsertOutcome::Inserted => {
                self.head = entry.seq;
                Ok(Appended::New(entry))
            }
            InsertOutcome::Duplicate(seq) => Ok(Appended::Duplicate(seq)),
        }
    }

    fn handle_append(&mut self, op: Operation, reply: Reply<u64>) {
        let op_id = op.op_id.clone();
        let result = self.append(op);

        match &result {
            Ok(Appended::New(entry)) => tracing::debug!(
                workspace = %self.workspace,
                seq = entry.seq,
                op_id = %op_id,
                kind = entry.op.kind.name(),
                "op appended"
            ),
            Ok(Appended::Duplicate(seq)) => tracing::debug!(
                workspace = %self.workspace,
                seq,
                op_id = %op_id,
                "duplicate op, returning existing seq"
            ),
            Err(e) => tracing::warn!(
                workspace = %self.workspace,
                op_id = %op_id,
                error = %e,
                "op rejected"
            ),
        }

        let outcome = result.map(|a| match a {
            Appended::New(entry) => (entry.seq, Some(entry)),
            Appended::Duplicate(seq) => (seq, None),
        });

        let new_entry = match reply {
            Reply::Caller(tx) => match outcome {
                Ok((seq, entry)) => {
                    let _ = tx.send(Ok(seq));
                    entry
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    None
                }
            },
            Reply::Session(session) => match outcome {
                Ok((seq, entry)) => {
                    self.send_to(
                        session,
                        ServerMessage::Accepted {
                            op_id: op_id.clone(),
                            seq,
                        },
                    );
                    entry
                }
                Err(e) => {
                    self.send_to(
                        session,
                        ServerMessage::Rejected {
                            op_id: op_id.clone(),
                            reason: e.to_string(),
                        },
                    );
                    None
                }
            },
        };

        if let Some(entry) = new_entry {
            let seq = entry.seq;
            self.broadcast(None, &ServerMessage::Op(entry));
            if self.config.compaction_interval > 0 && seq.is_multiple_of(self.config.compaction_interval) {
                self.compact();
            }
        }
    }

    /// Folds every entry since the stored snapshot into a new snapshot at
    /// the head. Failures are logged; the next attempt replays the whole
    /// missed range.
    fn compact(&self) {
        let result = self
            .materialize()
            .and_then(|snap| {
                self.io(|s| s.save_snapshot(&self.workspace, &snap))
                    .map(|()| snap)
            });
        match result {
            Ok(snap) => tracing::info!(
                workspace = %self.workspace,
                base_seq = snap.base_seq,
                tabs = snap.board.len(),
                "snapshot compacted"
            ),
            Err(e) => tracing::warn!(
                workspace = %self.workspace,
                head = self.head,
                error = %e,
                "compaction failed"
            ),
        }
    }

    /// Latest stored snapshot plus every later entry up to the head.
    fn materialize(&self) -> Result<Snapshot, StorageError> {
        let mut snapshot = self.io(|s| s.load_snapshot(&self.workspace))?;
        snapshot.board.sanitize();
        while snapshot.base_seq < self.head {
            let since = snapshot.base_seq;
            let page = self.io(|s| s.entries_after(&self.workspace, since, REPLAY_PAGE))?;
            let before = snapshot.base_seq;
            snapshot = replay(&snapshot, page.iter().take_while(|e| e.seq <= self.head));
            if snapshot.base_seq == before {
                break;
            }
        }
        Ok(snapshot)
    }

    fn sync(&self, since: u64) -> Result<SyncResponse, StorageError> {
        let maxseq = self.head;
        if since > maxseq || maxseq - since > self.config.sync_window {
            tracing::debug!(workspace = %self.workspace, since, maxseq, "sync: snapshot mode");
            return self.materialize().map(SyncResponse::Snapshot);
        }
        let limit = usize::try_from(maxseq - since).unwrap_or(usize::MAX);
        let ops = self.io(|s| s.entries_after(&self.workspace, since, limit))?;
        tracing::debug!(workspace = %self.workspace, since, maxseq, count = ops.len(), "sync: ops mode");
        Ok(SyncResponse::Ops { ops, maxseq })
    }

    // --- Sessions and presence ---

    fn join(&mut self, session: SessionId, peer: Peer, sender: SessionSender) {
        let first_for_user = !self
            .sessions
            .values()
            .any(|s| s.peer.user_id == peer.user_id);

        self.prune_awareness();
        let mut seen = HashSet::new();
        let online: Vec<Peer> = self
            .sessions
            .values()
            .filter(|s| s.peer.user_id != peer.user_id && seen.insert(s.peer.user_id.clone()))
            .map(|s| s.peer.clone())
            .collect();
        let hello = ServerMessage::Hello {
            you: peer.clone(),
            online,
            awareness: self.awareness_entries(),
            maxseq: self.head,
        };
        let _ = sender.send(hello);

        if first_for_user {
            self.broadcast(None, &ServerMessage::PresenceJoin(peer.clone()));
        }
        tracing::info!(
            workspace = %self.workspace,
            session = %session,
            user_id = %peer.user_id,
            sessions = self.sessions.len() + 1,
            "session joined"
        );
        self.sessions.insert(
            session,
            Session {
                peer,
                sender,
                last_delta: None,
            },
        );
    }

    fn leave(&mut self, session: SessionId) {
        let Some(gone) = self.sessions.remove(&session) else {
            return;
        };
        let user_id = gone.peer.user_id;
        tracing::info!(
            workspace = %self.workspace,
            session = %session,
            user_id = %user_id,
            "session left"
        );
        if self.sessions.values().any(|s| s.peer.user_id == user_id) {
            return;
        }
        self.broadcast(
            None,
            &ServerMessage::PresenceLeave {
                user_id: user_id.clone(),
            },
        );
        if self.awareness.remove(&user_id).is_some() {
            self.broadcast_awareness(None);
        }
    }

    // --- Ephemeral path ---

    fn aware_update(
        &mut self,
        session: SessionId,
        task_id: String,
        caret_start: u32,
        caret_end: u32,
        color: String,
    ) {
        let Some(peer) = self.sessions.get(&session).map(|s| s.peer.clone()) else {
            return;
        };
        self.awareness.insert(
            peer.user_id.clone(),
            Awareness {
                entry: AwarenessEntry {
                    user_id: peer.user_id,
                    task_id,
                    caret_start,
                    caret_end,
                    color,
                    name: peer.name,
                    updated_ms: now_millis(),
                },
                touched: Instant::now(),
            },
        );
        self.broadcast_awareness(Some(session));
    }

    fn aware_blur(&mut self, session: SessionId) {
        let Some(user_id) = self.sessions.get(&session).map(|s| s.peer.user_id.clone()) else {
            return;
        };
        if self.awareness.remove(&user_id).is_some() {
            self.broadcast_awareness(Some(session));
        }
    }

    fn delta(&mut self, session: SessionId, task_id: String, field: TaskField, value: String) {
        let min = self.config.delta_min_interval;
        let Some(s) = self.sessions.get_mut(&session) else {
            return;
        };
        let now = Instant::now();
        if s
            .last_delta
            .is_some_and(|last| now.duration_since(last) < min)
        {
            tracing::trace!(session = %session, "delta dropped by rate limit");
            return;
        }
        s.last_delta = Some(now);
        let msg = ServerMessage::Delta {
            by: s.peer.user_id.clone(),
            task_id,
            field,
            value,
        };
        self.broadcast(Some(session), &msg);
    }

    fn prune_awareness(&mut self) {
        let ttl = self.config.awareness_ttl;
        let now = Instant::now();
        self.awareness
            .retain(|_, a| now.duration_since(a.touched) <= ttl);
    }

    fn awareness_entries(&self) -> Vec<AwarenessEntry> {
        let mut entries: Vec<_> = self.awareness.values().map(|a| a.entry.clone()).collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    fn broadcast_awareness(&mut self, except: Option<SessionId>) {
        self.prune_awareness();
        let msg = ServerMessage::AwareState {
            entries: self.awareness_entries(),
        };
        self.broadcast(except, &msg);
    }

    // --- Fanout ---

    /// Sends to every session except `except`. Closed channels are skipped;
    /// their socket tasks unregister on their own.
    fn broadcast(&self, except: Option<SessionId>, msg: &ServerMessage) {
        for (id, session) in &self.sessions {
            if Some(*id) == except {
                continue;
            }
            let _ = session.sender.send(msg.clone());
        }
    }

    /// Delivers a catch-up result: as-is to a caller, or as `Sync` to a
    /// session.
    fn reply_sync<T>(
        &self,
        reply: Reply<T>,
        result: Result<T, StorageError>,
        to_response: impl FnOnce(T) -> SyncResponse,
    ) {
        match reply {
            Reply::Caller(tx) => {
                let _ = tx.send(result.map_err(SequencerError::from));
            }
            Reply::Session(session) => {
                let msg = match result {
                    Ok(value) => ServerMessage::Sync(to_response(value)),
                    Err(e) => ServerMessage::Error {
                        reason: format!("sync failed: {e}"),
                    },
                };
                self.send_to(session, msg);
            }
        }
    }

    fn send_to(&self, session: SessionId, msg: ServerMessage) {
        if let Some(s) = self.sessions.get(&session) {
            let _ = s.sender.send(msg);
        }
    }
}
