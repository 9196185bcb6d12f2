//! The board reducer.
//!
//! [`apply`] is a pure, total function of `(state, op)`. Every replica (the
//! server's snapshot compactor and each client's optimistic pass) runs the
//! same code, so identical logs yield identical boards. Malformed input never
//! fails; it is coerced to a safe default or the operation becomes a no-op.

use crate::board::{
    BoardState, Column, Task, insert_by_position, parse_due_date, renormalize,
};
use crate::op::{LogEntry, NewTask, OpKind, Operation, Snapshot, TaskField};

/// Tab used when a `create_task` names a blank tab.
pub const DEFAULT_TAB: &str = "Default";

/// Returns the state after applying `op` to `state`.
#[must_use]
pub fn apply(state: &BoardState, op: &Operation) -> BoardState {
    let mut next = state.clone();
    apply_in_place(&mut next, op);
    next
}

/// Applies `op` to `state` in place.
pub fn apply_in_place(state: &mut BoardState, op: &Operation) {
    match &op.kind {
        OpKind::CreateTask { tab, column, task } => create_task(state, op, tab, *column, task),
        OpKind::UpdateTaskField {
            task_id,
            field,
            value,
        } => update_task_field(state, op, task_id, *field, value),
        OpKind::MoveTask { task_id, to, pos } => move_task(state, op, task_id, *to, *pos),
        OpKind::DeleteTask { task_id } => delete_task(state, task_id),
        OpKind::RenameTab { from, to } => rename_tab(state, from, to),
    }
}

/// Folds log entries into `snapshot`, returning the state at the last
/// entry's sequence. Entries at or below `snapshot.base_seq` are skipped.
#[must_use]
pub fn replay<'a>(snapshot: &Snapshot, entries: impl IntoIterator<Item = &'a LogEntry>) -> Snapshot {
    let mut board = snapshot.board.clone();
    let mut base_seq = snapshot.base_seq;
    for entry in entries {
        if entry.seq <= base_seq {
            continue;
        }
        apply_in_place(&mut board, &entry.op);
        base_seq = entry.seq;
    }
    Snapshot { board, base_seq }
}

fn stamp(task: &mut Task, op: &Operation) {
    task.upd = op.ts;
    task.by = Some(op.client_id.clone());
}

fn normalize_new_task(op: &Operation, raw: &NewTask) -> Task {
    let id = if raw.id.trim().is_empty() {
        format!("task-{}", op.op_id)
    } else {
        raw.id.clone()
    };
    Task {
        id,
        content: raw.content.clone(),
        due_date: parse_due_date(&raw.due_date),
        priority: raw.priority.unwrap_or_default(),
        pos: raw.pos,
        upd: raw.upd.unwrap_or(op.ts),
        by: Some(raw.by.clone().unwrap_or_else(|| op.client_id.clone())),
    }
}

fn create_task(
    state: &mut BoardState,
    op: &Operation,
    tab: &str,
    column: Option<Column>,
    raw: &NewTask,
) {
    let tab_name = if tab.trim().is_empty() { DEFAULT_TAB } else { tab };
    let task = normalize_new_task(op, raw);
    let list = state
        .ensure_tab(tab_name)
        .column_mut(column.unwrap_or_default());
    insert_by_position(list, task);
}

fn update_task_field(
    state: &mut BoardState,
    op: &Operation,
    task_id: &str,
    field: TaskField,
    value: &str,
) {
    let Some(loc) = state.locate(task_id) else {
        return;
    };
    let Some(task) = state
        .tab_mut(&loc.tab)
        .and_then(|tab| tab.column_mut(loc.column).get_mut(loc.index))
    else {
        return;
    };
    match field {
        TaskField::Content => task.content = value.to_string(),
        TaskField::DueDate => task.due_date = parse_due_date(value),
        TaskField::Priority => {
            if let Ok(priority) = value.parse() {
                task.priority = priority;
            }
        }
    }
    stamp(task, op);
}

fn move_task(state: &mut BoardState, op: &Operation, task_id: &str, to: Column, pos: f64) {
    let Some(loc) = state.locate(task_id) else {
        return;
    };
    let Some(tab) = state.tab_mut(&loc.tab) else {
        return;
    };
    let source = tab.column_mut(loc.column);
    let mut task = source.remove(loc.index);
    renormalize(source);

    task.pos = pos;
    stamp(&mut task, op);
    insert_by_position(tab.column_mut(to), task);
}

fn delete_task(state: &mut BoardState, task_id: &str) {
    let Some(loc) = state.locate(task_id) else {
        return;
    };
    if let Some(tab) = state.tab_mut(&loc.tab) {
        let list = tab.column_mut(loc.column);
        list.remove(loc.index);
        renormalize(list);
    }
}

fn rename_tab(state: &mut BoardState, from: &str, to: &str) {
    if to.trim().is_empty() || from == to || state.contains_tab(to) {
        return;
    }
    if let Some(tab) = state.remove_tab(from) {
        state.insert_tab(to.to_string(), tab);
    }
}
