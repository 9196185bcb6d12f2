//! Live channel wire protocol.
//!
//! Defines the [`ClientMessage`] and [`ServerMessage`] enums that are
//! postcard-encoded and sent over WebSocket binary frames between clients and
//! the workspace server. Durable traffic (`Op`, presence) and ephemeral
//! traffic (awareness, deltas) share the socket but never share a path on the
//! server: only `Submit` reaches the op log.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::op::{LogEntry, Operation, Snapshot, TaskField};

/// A connected user as seen by other sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Stable user id from the identity collaborator.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
}

/// Where a user's caret currently sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    /// User the entry belongs to.
    pub user_id: String,
    /// Task being edited.
    pub task_id: String,
    /// Selection start, in characters.
    pub caret_start: u32,
    /// Selection end, in characters.
    pub caret_end: u32,
    /// Display color, e.g. `#3b82f6`.
    pub color: String,
    /// Display name.
    pub name: String,
    /// Server time of the last update, milliseconds since epoch.
    pub updated_ms: u64,
}

/// Response to a catch-up request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    /// Ordered entries `(since, maxseq]`.
    Ops {
        /// Entries in ascending `seq`.
        ops: Vec<LogEntry>,
        /// Highest sequence in the log at the time of the request.
        maxseq: u64,
    },
    /// A fresh snapshot; the gap was too large for an op range.
    Snapshot(Snapshot),
}

impl SyncResponse {
    /// Sequence the client is at after installing this response.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        match self {
            Self::Ops { maxseq, .. } => *maxseq,
            Self::Snapshot(snapshot) => snapshot.base_seq,
        }
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    ///
    /// Server responds with [`ServerMessage::Hello`] on success or
    /// [`ServerMessage::Error`] followed by close.
    Join {
        /// Workspace to join.
        workspace: String,
        /// Bearer token for the identity collaborator.
        token: String,
    },
    /// Submit an operation for sequencing.
    Submit {
        /// The operation. `client_id` is overwritten by the server.
        op: Operation,
    },
    /// Ask for everything after `since`.
    SyncRequest {
        /// The client's `lastSeq`.
        since: u64,
    },
    /// Caret moved or focus entered a task.
    AwareUpdate {
        /// Task being edited.
        task_id: String,
        /// Selection start.
        caret_start: u32,
        /// Selection end.
        caret_end: u32,
        /// Display color.
        color: String,
    },
    /// Focus left the task being edited.
    AwareBlur,
    /// Uncommitted text of a field, for live preview by others.
    Delta {
        /// Task being edited.
        task_id: String,
        /// Field being edited.
        field: TaskField,
        /// Current draft value.
        value: String,
    },
    /// Ask for the board materialized at the head, for a cold start.
    ///
    /// Answered with [`ServerMessage::Sync`] carrying a snapshot.
    SnapshotRequest,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sent once after a successful `Join`.
    Hello {
        /// The authenticated user behind this session.
        you: Peer,
        /// Other users currently connected to the workspace.
        online: Vec<Peer>,
        /// Live awareness entries.
        awareness: Vec<AwarenessEntry>,
        /// Highest sequence in the workspace log.
        maxseq: u64,
    },
    /// An accepted operation in its final order.
    Op(LogEntry),
    /// The submitting session's acknowledgment.
    Accepted {
        /// Operation that was accepted (or recognised as a duplicate).
        op_id: String,
        /// Its sequence.
        seq: u64,
    },
    /// The operation was refused; nothing was persisted.
    Rejected {
        /// Operation that was refused.
        op_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Answer to [`ClientMessage::SyncRequest`] or
    /// [`ClientMessage::SnapshotRequest`].
    Sync(SyncResponse),
    /// A user opened their first session in the workspace.
    PresenceJoin(Peer),
    /// A user closed their last session in the workspace.
    PresenceLeave {
        /// User that left.
        user_id: String,
    },
    /// Current awareness entries after a change.
    AwareState {
        /// All live entries.
        entries: Vec<AwarenessEntry>,
    },
    /// Another user's uncommitted edit.
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
    /// Server reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Encodes a [`ClientMessage`] for a WebSocket binary frame.
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_client(msg: &ClientMessage) -> Result<Vec<u8>, CodecError> {
    codec::encode(msg)
}

/// Decodes a [`ClientMessage`] from a WebSocket binary frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a valid message.
pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    codec::decode(bytes)
}

/// Encodes a [`ServerMessage`] for a WebSocket binary frame.
///
/// # Errors
///
/// Returns [`CodecError`] if serialization fails.
pub fn encode_server(msg: &ServerMessage) -> Result<Vec<u8>, CodecError> {
    codec::encode(msg)
}

/// Decodes a [`ServerMessage`] from a WebSocket binary frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are not a valid message.
pub fn decode_server(bytes: &[u8]) -> Result<ServerMessage, CodecError> {
    codec::decode(bytes)
}
