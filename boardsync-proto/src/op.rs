//! Board operations: the closed set of mutations a client may submit.
//!
//! An [`Operation`] is immutable once the sequencer accepts it. Its `kind`
//! is a closed tagged union; an unknown kind fails to decode, so ingress only
//! needs to check the fields serde cannot (see [`Operation::validate`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::board::{BoardState, Column, Priority};

/// Maximum accepted length of an `op_id`, in bytes.
pub const MAX_OP_ID_LEN: usize = 128;

/// Ordering key meaning "end of column": 2^53, far past any dense position
/// and exact in every text encoding.
///
/// Non-finite keys append too, but JSON cannot carry them, so they are
/// rewritten to this value before an operation is stored or sent.
pub const APPEND_POS: f64 = 9_007_199_254_740_992.0;

/// Generates a fresh, time-ordered operation id.
#[must_use]
pub fn new_op_id() -> String {
    Uuid::now_v7().to_string()
}

/// Reasons an operation is refused at ingress. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpError {
    /// The idempotency key is empty or whitespace.
    #[error("op_id must not be empty")]
    EmptyOpId,
    /// The idempotency key exceeds [`MAX_OP_ID_LEN`].
    #[error("op_id is {0} bytes, limit is {MAX_OP_ID_LEN}")]
    OpIdTooLong(usize),
}

/// Task fields that can be edited in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskField {
    /// Body text.
    #[serde(rename = "content")]
    Content,
    /// Calendar due date, `YYYY-MM-DD` or empty.
    #[serde(rename = "dueDate")]
    DueDate,
    /// `High`, `Medium` or `Low`.
    #[serde(rename = "priority")]
    Priority,
}

impl std::fmt::Display for TaskField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::DueDate => write!(f, "dueDate"),
            Self::Priority => write!(f, "priority"),
        }
    }
}

/// Task body carried by a `create_task` operation.
///
/// Fields are raw client input; the reducer normalizes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Client-chosen id. Blank becomes `task-<op_id>`.
    pub id: String,
    /// Body text.
    pub content: String,
    /// `YYYY-MM-DD`, anything else becomes no date.
    #[serde(rename = "dueDate", default)]
    pub due_date: String,
    /// Priority, `Medium` if absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Requested ordering key; non-finite appends.
    pub pos: f64,
    /// Last-modified time; defaults to the operation timestamp.
    #[serde(default)]
    pub upd: Option<u64>,
    /// Last-modifying actor; defaults to the operation's client.
    #[serde(default)]
    pub by: Option<String>,
}

/// The mutation an operation performs, with its own field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Insert a task into a column of a tab, creating the tab if needed.
    CreateTask {
        /// Tab name. Blank becomes `Default`.
        tab: String,
        /// Target column, `todo` if absent.
        #[serde(default)]
        column: Option<Column>,
        /// The task to insert.
        task: NewTask,
    },
    /// Set one field of an existing task.
    UpdateTaskField {
        /// Task to edit.
        task_id: String,
        /// Field to set.
        field: TaskField,
        /// New raw value.
        value: String,
    },
    /// Move a task to a column of the same tab.
    MoveTask {
        /// Task to move.
        task_id: String,
        /// Destination column.
        to: Column,
        /// Requested key in the destination; non-finite appends.
        pos: f64,
    },
    /// Remove a task.
    DeleteTask {
        /// Task to remove.
        task_id: String,
    },
    /// Rename a tab.
    RenameTab {
        /// Existing name.
        from: String,
        /// New name; must be non-empty and unused.
        to: String,
    },
}

impl OpKind {
    /// Wire name of the operation type.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateTask { .. } => "create_task",
            Self::UpdateTaskField { .. } => "update_task_field",
            Self::MoveTask { .. } => "move_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::RenameTab { .. } => "rename_tab",
        }
    }
}

/// A client-submitted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Idempotency key, unique per workspace.
    pub op_id: String,
    /// Submitting actor. The server overwrites it with the authenticated user.
    pub client_id: String,
    /// The submitter's `lastSeq` when the operation was built.
    pub base_seq: u64,
    /// Client wall clock, milliseconds since epoch.
    pub ts: u64,
    /// What the operation does.
    pub kind: OpKind,
}

impl Operation {
    /// Builds an operation with a fresh `op_id` stamped at the current time.
    #[must_use]
    pub fn new(client_id: impl Into<String>, base_seq: u64, kind: OpKind) -> Self {
        let mut op = Self {
            op_id: new_op_id(),
            client_id: client_id.into(),
            base_seq,
            ts: now_millis(),
            kind,
        };
        op.normalize();
        op
    }

    /// Rewrites non-finite ordering keys to [`APPEND_POS`]. The reducer
    /// treats both as "append", so the effect is unchanged.
    pub fn normalize(&mut self) {
        let pos = match &mut self.kind {
            OpKind::CreateTask { task, .. } => &mut task.pos,
            OpKind::MoveTask { pos, .. } => pos,
            _ => return,
        };
        if !pos.is_finite() {
            *pos = APPEND_POS;
        }
    }

    /// Checks what the type system cannot: a usable idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`OpError`] if the `op_id` is blank or too long.
    pub fn validate(&self) -> Result<(), OpError> {
        if self.op_id.trim().is_empty() {
            return Err(OpError::EmptyOpId);
        }
        if self.op_id.len() > MAX_OP_ID_LEN {
            return Err(OpError::OpIdTooLong(self.op_id.len()));
        }
        Ok(())
    }
}

/// An accepted operation with its position in the workspace order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly increasing per workspace, starting at 1.
    pub seq: u64,
    /// The accepted operation.
    pub op: Operation,
}

/// Materialized board state together with the last sequence it reflects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Board state after applying every entry up to `base_seq`.
    #[serde(rename = "tabs")]
    pub board: BoardState,
    /// Highest sequence folded into `board`; 0 for the empty snapshot.
    pub base_seq: u64,
}

/// Milliseconds since the Unix epoch, saturating on clock errors.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
