//! Property-based tests for the board reducer.
//!
//! Uses proptest to verify:
//! 1. Replaying the same log twice yields identical boards.
//! 2. Snapshot at any cut point + the remaining tail equals a full replay.
//! 3. After every operation each column holds dense positions `1..=n`.
//! 4. Random bytes never cause a panic in the live-channel decoders.

#![allow(clippy::cast_precision_loss)]

use boardsync_proto::board::{BoardState, Column};
use boardsync_proto::live;
use boardsync_proto::op::{LogEntry, NewTask, OpKind, Operation, Snapshot, TaskField};
use boardsync_proto::{apply, replay};
use proptest::prelude::*;

// --- Strategies ---

const TABS: &[&str] = &["", "Backlog", "Sprint", "Ops"];
const TASK_IDS: &[&str] = &["t1", "t2", "t3", "t4", "t5", ""];

fn arb_tab() -> impl Strategy<Value = String> {
    prop::sample::select(TABS).prop_map(str::to_string)
}

fn arb_task_id() -> impl Strategy<Value = String> {
    prop::sample::select(TASK_IDS).prop_map(str::to_string)
}

fn arb_column() -> impl Strategy<Value = Column> {
    prop::sample::select(Column::ALL.to_vec())
}

/// Positions include non-finite values, which must append.
fn arb_pos() -> impl Strategy<Value = f64> {
    prop_oneof![
        4 => -2.0f64..12.0,
        1 => Just(f64::INFINITY),
        1 => Just(f64::NAN),
    ]
}

fn arb_kind() -> impl Strategy<Value = OpKind> {
    prop_oneof![
        (arb_tab(), prop::option::of(arb_column()), arb_task_id(), arb_pos(), "[a-z ]{0,12}")
            .prop_map(|(tab, column, id, pos, content)| OpKind::CreateTask {
                tab,
                column,
                task: NewTask {
                    id,
                    content,
                    due_date: "2025-01-15".into(),
                    priority: None,
                    pos,
                    upd: None,
                    by: None,
                },
            }),
        (
            arb_task_id(),
            prop::sample::select(vec![TaskField::Content, TaskField::DueDate, TaskField::Priority]),
            prop::sample::select(vec!["High", "Low", "bogus", "2024-02-29", "x"]),
        )
            .prop_map(|(task_id, field, value)| OpKind::UpdateTaskField {
                task_id,
                field,
                value: value.to_string(),
            }),
        (arb_task_id(), arb_column(), arb_pos())
            .prop_map(|(task_id, to, pos)| OpKind::MoveTask { task_id, to, pos }),
        arb_task_id().prop_map(|task_id| OpKind::DeleteTask { task_id }),
        (arb_tab(), arb_tab()).prop_map(|(from, to)| OpKind::RenameTab { from, to }),
    ]
}

fn arb_log() -> impl Strategy<Value = Vec<LogEntry>> {
    prop::collection::vec((arb_kind(), 0u64..1_000), 0..40).prop_map(|kinds| {
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, (kind, ts))| {
                let seq = i as u64 + 1;
                LogEntry {
                    seq,
                    op: Operation {
                        op_id: format!("op-{seq}"),
                        client_id: if seq % 2 == 0 { "alice" } else { "bob" }.to_string(),
                        base_seq: seq - 1,
                        ts,
                        kind,
                    },
                }
            })
            .collect()
    })
}

fn fold(entries: &[LogEntry]) -> BoardState {
    entries
        .iter()
        .fold(BoardState::new(), |state, entry| apply(&state, &entry.op))
}

/// `PartialEq` on `f64` treats NaN as unequal; reducers never store NaN
/// (renormalization overwrites every key) but compare via JSON to be exact.
fn same(a: &BoardState, b: &BoardState) -> bool {
    serde_json::to_string(a).ok() == serde_json::to_string(b).ok()
}

// --- Properties ---

proptest! {
    #[test]
    fn replay_is_deterministic(log in arb_log()) {
        prop_assert!(same(&fold(&log), &fold(&log)));
    }

    #[test]
    fn snapshot_plus_tail_equals_full_replay(log in arb_log(), cut in 0usize..41) {
        let cut = cut.min(log.len());
        let snapshot = replay(&Snapshot::default(), log[..cut].iter());
        prop_assert_eq!(snapshot.base_seq, cut as u64);

        let resumed = replay(&snapshot, log.iter());
        let full = replay(&Snapshot::default(), log.iter());
        prop_assert!(same(&resumed.board, &full.board));
        prop_assert_eq!(resumed.base_seq, full.base_seq);
    }

    #[test]
    fn columns_stay_dense_after_every_op(log in arb_log()) {
        let mut state = BoardState::new();
        for entry in &log {
            state = apply(&state, &entry.op);
            for (_, tab) in state.tabs() {
                for column in Column::ALL {
                    for (i, task) in tab.column(column).iter().enumerate() {
                        prop_assert!((task.pos - (i as f64 + 1.0)).abs() < f64::EPSILON);
                    }
                }
            }
        }
    }

    #[test]
    fn random_bytes_never_panic_decoders(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = live::decode_client(&bytes);
        let _ = live::decode_server(&bytes);
    }
}
