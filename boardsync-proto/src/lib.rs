//! Shared definitions for boardsync: the board model, the closed set of
//! board operations, the deterministic reducer, and the live-channel wire
//! format.

pub mod board;
pub mod codec;
pub mod live;
pub mod op;
pub mod reduce;

pub use board::{BoardState, Column, Priority, Tab, Task, position_between};
pub use op::{APPEND_POS, LogEntry, NewTask, OpError, OpKind, Operation, Snapshot, TaskField};
pub use reduce::{apply, apply_in_place, replay};
