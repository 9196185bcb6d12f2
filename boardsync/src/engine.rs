//! Client-side sync engine.
//!
//! The engine keeps two boards. The *confirmed* board reflects exactly the
//! workspace log up to `last_seq`. The *visible* board is what the user sees:
//! the confirmed board plus every local operation that has not yet come back
//! from the sequencer. Catch-up installs rebuild the visible board from the
//! confirmed one, so optimistic effects never outlive their operation.
//!
//! A replica at sequence 0 catches up by installing a snapshot at the head
//! rather than replaying the log from the start.
//!
//! The engine does no I/O. Each entry point returns the [`Effect`]s the
//! connection layer must carry out, in order.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use boardsync_proto::live::SyncResponse;
use boardsync_proto::{BoardState, LogEntry, OpKind, Operation, Snapshot, apply_in_place};

/// How far the visible board can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Connected and applying the live stream contiguously.
    Synced,
    /// Connected, but a catch-up is outstanding.
    Stale,
    /// Not connected; local edits are queued.
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::Stale => write!(f, "not fully synced"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Work the connection layer must perform on behalf of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send this operation to the sequencer.
    Transmit(Operation),
    /// Ask for everything after `since`.
    RequestSync {
        /// The engine's `last_seq` when the request was made.
        since: u64,
    },
    /// Ask for a snapshot at the head (cold start).
    RequestSnapshot,
    /// A catch-up response was installed.
    CaughtUp {
        /// Confirmed sequence after the install.
        last_seq: u64,
        /// Whether the response was a snapshot rather than an op range.
        from_snapshot: bool,
    },
    /// A local operation is now part of the confirmed board.
    Confirmed {
        /// The operation's idempotency key.
        op_id: String,
    },
    /// A local operation was refused and its effect rolled back.
    Dropped {
        /// The operation's idempotency key.
        op_id: String,
        /// Why the sequencer refused it.
        reason: String,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    op: Operation,
    /// Transmitted on the current connection.
    sent: bool,
    /// Sequence from an acknowledgment that arrived ahead of `last_seq`.
    acked: Option<u64>,
}

/// Optimistic replica of one workspace.
#[derive(Debug)]
pub struct SyncEngine {
    client_id: String,
    confirmed: BoardState,
    visible: BoardState,
    last_seq: u64,
    pending: VecDeque<Pending>,
    /// Present while a catch-up is in flight: ids of the pending operations
    /// transmitted before the first request, which any response is known to
    /// cover. Retries never widen it.
    fence: Option<HashSet<String>>,
    connected: bool,
    revision: u64,
}

impl SyncEngine {
    /// Starts from an empty board at sequence 0.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::from_snapshot(client_id, Snapshot::default())
    }

    /// Cold start from a snapshot: `last_seq` becomes its `base_seq`.
    #[must_use]
    pub fn from_snapshot(client_id: impl Into<String>, snapshot: Snapshot) -> Self {
        Self {
            client_id: client_id.into(),
            visible: snapshot.board.clone(),
            confirmed: snapshot.board,
            last_seq: snapshot.base_seq,
            pending: VecDeque::new(),
            fence: None,
            connected: false,
            revision: 0,
        }
    }

    /// Actor id stamped on local operations.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The board as the user should see it.
    #[must_use]
    pub const fn board(&self) -> &BoardState {
        &self.visible
    }

    /// The board as of `last_seq`, without local edits.
    #[must_use]
    pub const fn confirmed(&self) -> &BoardState {
        &self.confirmed
    }

    /// Highest sequence folded into the confirmed board.
    #[must_use]
    pub const fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Local operations not yet confirmed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Local operations not yet confirmed, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter().map(|p| &p.op)
    }

    /// Returns `true` if `op_id` is still pending.
    #[must_use]
    pub fn is_pending(&self, op_id: &str) -> bool {
        self.pending_index(op_id).is_some()
    }

    /// Returns `true` while a catch-up response is awaited.
    #[must_use]
    pub const fn is_syncing(&self) -> bool {
        self.fence.is_some()
    }

    /// Returns `true` between `on_hello` and `on_disconnect`.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Current trust level of the visible board.
    #[must_use]
    pub const fn status(&self) -> SyncStatus {
        if !self.connected {
            SyncStatus::Offline
        } else if self.fence.is_some() {
            SyncStatus::Stale
        } else {
            SyncStatus::Synced
        }
    }

    /// Incremented whenever the visible board changes.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Records a local mutation.
    ///
    /// The operation is applied to the visible board immediately and kept
    /// pending until the sequencer's echo arrives. It is transmitted now if
    /// connected, otherwise on the next `on_hello`.
    pub fn local(&mut self, kind: OpKind) -> (String, Vec<Effect>) {
        let op = Operation::new(self.client_id.clone(), self.last_seq, kind);
        let op_id = op.op_id.clone();
        apply_in_place(&mut self.visible, &op);
        self.bump();

        let sent = self.connected;
        let effects = if sent {
            vec![Effect::Transmit(op.clone())]
        } else {
            Vec::new()
        };
        self.pending.push_back(Pending {
            op,
            sent,
            acked: None,
        });
        (op_id, effects)
    }

    /// A session was established.
    ///
    /// Every pending operation is (re)transmitted, since resends are
    /// idempotent. If the server's head differs from ours, a catch-up is
    /// requested after the resends so the response covers all of them.
    pub fn on_hello(&mut self, user_id: impl Into<String>, maxseq: u64) -> Vec<Effect> {
        self.connected = true;
        self.client_id = user_id.into();
        self.fence = None;

        let mut effects: Vec<Effect> = self
            .pending
            .iter_mut()
            .map(|p| {
                p.sent = true;
                Effect::Transmit(p.op.clone())
            })
            .collect();
        if maxseq != self.last_seq {
            effects.extend(self.begin_sync());
        }
        effects
    }

    /// The session ended. Pending operations stay queued for the next one.
    pub fn on_disconnect(&mut self) {
        self.connected = false;
        self.fence = None;
        for p in &mut self.pending {
            p.sent = false;
        }
    }

    /// A sequenced operation arrived on the live stream.
    pub fn on_op(&mut self, entry: &LogEntry) -> Vec<Effect> {
        if self.fence.is_some() {
            // Everything delivered before the catch-up response is covered by it.
            return Vec::new();
        }
        if entry.seq <= self.last_seq {
            tracing::trace!(seq = entry.seq, last_seq = self.last_seq, "stale op ignored");
            return Vec::new();
        }
        if entry.seq != self.last_seq + 1 {
            tracing::debug!(seq = entry.seq, last_seq = self.last_seq, "sequence gap");
            return self.begin_sync();
        }

        apply_in_place(&mut self.confirmed, &entry.op);
        self.last_seq = entry.seq;

        if let Some(index) = self.pending_index(&entry.op.op_id) {
            // Own echo: already on the visible board.
            self.pending.remove(index);
            self.settle();
            return vec![Effect::Confirmed {
                op_id: entry.op.op_id.clone(),
            }];
        }
        apply_in_place(&mut self.visible, &entry.op);
        self.bump();
        Vec::new()
    }

    /// The sequencer acknowledged one of our operations.
    ///
    /// Only an acknowledgment at or below `last_seq` confirms anything; a
    /// later one is remembered and confirmed by the echo or by a catch-up
    /// that reaches its sequence.
    pub fn on_accepted(&mut self, op_id: &str, seq: u64) -> Vec<Effect> {
        let Some(index) = self.pending_index(op_id) else {
            return Vec::new();
        };
        if seq > self.last_seq {
            self.pending[index].acked = Some(seq);
            return Vec::new();
        }
        self.pending.remove(index);
        self.settle();
        vec![Effect::Confirmed {
            op_id: op_id.to_string(),
        }]
    }

    /// The sequencer refused one of our operations.
    ///
    /// The pending entry is dropped and a catch-up rebuilds the visible board
    /// without it.
    pub fn on_rejected(&mut self, op_id: &str, reason: &str) -> Vec<Effect> {
        let Some(index) = self.pending_index(op_id) else {
            return Vec::new();
        };
        self.pending.remove(index);
        if let Some(fence) = &mut self.fence {
            fence.remove(op_id);
        }
        let mut effects = vec![Effect::Dropped {
            op_id: op_id.to_string(),
            reason: reason.to_string(),
        }];
        effects.extend(self.begin_sync());
        effects
    }

    /// The catch-up request went unanswered; ask again.
    ///
    /// The first response may still arrive, so the fence keeps only what
    /// that one covers. Operations sent since are confirmed by their
    /// acknowledgment instead.
    pub fn retry_sync(&mut self) -> Vec<Effect> {
        if self.fence.is_none() {
            return Vec::new();
        }
        vec![self.sync_request()]
    }

    /// Installs a catch-up response.
    ///
    /// Replaces the confirmed board, drops every pending operation the
    /// response covers, and re-applies the rest on top. A response that
    /// arrives when no catch-up is outstanding is ignored.
    pub fn on_sync(&mut self, response: SyncResponse) -> Vec<Effect> {
        let Some(mut covered) = self.fence.take() else {
            tracing::debug!("unsolicited sync response ignored");
            return Vec::new();
        };

        let from_snapshot = matches!(response, SyncResponse::Snapshot(_));
        match response {
            SyncResponse::Ops { ops, maxseq } => {
                for entry in &ops {
                    if entry.seq > self.last_seq {
                        apply_in_place(&mut self.confirmed, &entry.op);
                        self.last_seq = entry.seq;
                    }
                    covered.insert(entry.op.op_id.clone());
                }
                self.last_seq = self.last_seq.max(maxseq);
            }
            SyncResponse::Snapshot(snapshot) => {
                self.confirmed = snapshot.board;
                self.last_seq = snapshot.base_seq;
            }
        }

        let mut effects = Vec::new();
        let last_seq = self.last_seq;
        self.pending.retain(|p| {
            if covered.contains(&p.op.op_id) || p.acked.is_some_and(|seq| seq <= last_seq) {
                effects.push(Effect::Confirmed {
                    op_id: p.op.op_id.clone(),
                });
                false
            } else {
                true
            }
        });
        self.rebase();
        effects.push(Effect::CaughtUp {
            last_seq,
            from_snapshot,
        });
        effects
    }

    fn begin_sync(&mut self) -> Vec<Effect> {
        if self.fence.is_some() {
            return Vec::new();
        }
        self.fence = Some(
            self.pending
                .iter()
                .filter(|p| p.sent)
                .map(|p| p.op.op_id.clone())
                .collect(),
        );
        vec![self.sync_request()]
    }

    const fn sync_request(&self) -> Effect {
        if self.last_seq == 0 {
            Effect::RequestSnapshot
        } else {
            Effect::RequestSync {
                since: self.last_seq,
            }
        }
    }

    fn rebase(&mut self) {
        let mut visible = self.confirmed.clone();
        for p in &self.pending {
            apply_in_place(&mut visible, &p.op);
        }
        self.visible = visible;
        self.bump();
    }

    /// Once nothing is pending the visible board must equal the confirmed
    /// one. They differ only when foreign operations were interleaved with
    /// our own in a different order than we applied them.
    fn settle(&mut self) {
        if self.pending.is_empty() && self.visible != self.confirmed {
            self.visible = self.confirmed.clone();
            self.bump();
        }
    }

    fn pending_index(&self, op_id: &str) -> Option<usize> {
        self.pending.iter().position(|p| p.op.op_id == op_id)
    }

    const fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}
