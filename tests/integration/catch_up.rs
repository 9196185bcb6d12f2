// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for catch-up of clients that join behind the log head.
//!
//! A fresh client joining a workspace with history installs a snapshot at
//! the head instead of replaying the log. Reconnecting clients ask for
//! everything after their last sequence (see `reconnect.rs`). Either way the
//! client ends up with the server's board.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boardsync::engine::SyncStatus;
use boardsync::net::{self, ClientView, NetCommand, NetConfig, NetEvent, NetHandle, SharedView};
use boardsync_proto::{Column, NewTask, OpKind, Operation, TaskField};
use boardsync_server::auth::{GrantEntry, Role, StaticDirectory, UserEntry};
use boardsync_server::hub::Hub;
use boardsync_server::sequencer::SequencerConfig;
use boardsync_server::server::{self, AppState};
use boardsync_server::storage::MemoryStorage;

// =============================================================================
// Helpers
// =============================================================================

fn user(name: &str) -> UserEntry {
    UserEntry {
        token: format!("tok-{name}"),
        user_id: name.to_string(),
        name: name.to_string(),
        email: String::new(),
    }
}

fn editor(user_id: &str) -> GrantEntry {
    GrantEntry {
        workspace: "*".to_string(),
        user_id: user_id.to_string(),
        role: Role::Editor,
    }
}

async fn start_server(config: SequencerConfig) -> (SocketAddr, Arc<AppState>) {
    let directory = Arc::new(StaticDirectory::new(
        &[user("ada"), user("bob")],
        &[editor("ada"), editor("bob")],
    ));
    let hub = Hub::new(Arc::new(MemoryStorage::new()), config);
    let state = Arc::new(AppState::new(hub, directory.clone(), directory, 256 * 1024));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start server");
    (addr, state)
}

async fn connect(addr: SocketAddr, name: &str) -> NetHandle {
    let mut config = NetConfig::new(format!("ws://{addr}"), "w".into(), format!("tok-{name}"));
    config.sync_timeout = Duration::from_secs(2);
    net::spawn_net(config).await.expect("client failed to connect")
}

fn create(id: &str) -> OpKind {
    OpKind::CreateTask {
        tab: "Main".to_string(),
        column: Some(Column::Todo),
        task: NewTask {
            id: id.to_string(),
            content: format!("task {id}"),
            due_date: String::new(),
            priority: None,
            pos: f64::INFINITY,
            upd: None,
            by: None,
        },
    }
}

/// Appends operations straight into the workspace log, bypassing clients.
async fn seed(state: &AppState, kinds: Vec<OpKind>) -> u64 {
    let sequencer = state.hub().sequencer("w").unwrap();
    let mut seq = 0;
    for kind in kinds {
        seq = sequencer.append(Operation::new("ada", seq, kind)).await.unwrap();
    }
    seq
}

async fn wait_until<F>(view: &SharedView, description: &str, pred: F)
where
    F: Fn(&ClientView) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if pred(&*view.read()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for {description}");
}

// =============================================================================
// Tests
// =============================================================================

/// A client joining after others edited starts from a snapshot.
#[tokio::test]
async fn late_joiner_cold_starts_from_snapshot() {
    let (addr, state) = start_server(SequencerConfig::default()).await;
    let ada = connect(addr, "ada").await;
    for i in 0..5 {
        ada.commands
            .send(NetCommand::Mutate(create(&format!("t{i}"))))
            .await
            .unwrap();
    }
    wait_until(&ada.view, "ada settled", |v| v.last_seq == 5 && v.pending == 0).await;

    let mut bob = connect(addr, "bob").await;
    let welcome = loop {
        match bob.events.recv().await.expect("events closed") {
            NetEvent::Welcome { maxseq, .. } => break maxseq,
            _ => continue,
        }
    };
    assert_eq!(welcome, 5);
    let caught_up = loop {
        match bob.events.recv().await.expect("events closed") {
            event @ NetEvent::CaughtUp { .. } => break event,
            _ => continue,
        }
    };
    assert_eq!(
        caught_up,
        NetEvent::CaughtUp {
            last_seq: 5,
            from_snapshot: true
        }
    );

    wait_until(&bob.view, "bob caught up", |v| {
        v.last_seq == 5 && v.status == SyncStatus::Synced
    })
    .await;
    let snapshot = state.hub().sequencer("w").unwrap().snapshot().await.unwrap();
    assert_eq!(bob.view.read().board, snapshot.board);
    assert_eq!(bob.view.read().board.task_count(), 5);
}

/// The snapshot reflects deletes and edits, not just creates.
#[tokio::test]
async fn cold_start_snapshot_folds_every_op_kind() {
    let config = SequencerConfig {
        compaction_interval: 4,
        sync_window: 3,
        ..SequencerConfig::default()
    };
    let (addr, state) = start_server(config).await;

    let mut kinds: Vec<OpKind> = (0..8).map(|i| create(&format!("t{i}"))).collect();
    kinds.push(OpKind::DeleteTask {
        task_id: "t0".into(),
    });
    kinds.push(OpKind::UpdateTaskField {
        task_id: "t1".into(),
        field: TaskField::Content,
        value: "renamed".into(),
    });
    let head = seed(&state, kinds).await;
    assert_eq!(head, 10);

    let bob = connect(addr, "bob").await;
    wait_until(&bob.view, "bob caught up", |v| {
        v.last_seq == head && v.status == SyncStatus::Synced
    })
    .await;

    let view = bob.view.read();
    assert_eq!(view.board.task_count(), 7);
    assert!(view.board.task("t0").is_none());
    assert_eq!(view.board.task("t1").unwrap().content, "renamed");
    drop(view);
    let snapshot = state.hub().sequencer("w").unwrap().snapshot().await.unwrap();
    assert_eq!(bob.view.read().board, snapshot.board);
}

/// After catching up from a snapshot, live ops continue from its sequence.
#[tokio::test]
async fn live_ops_follow_snapshot_install() {
    let config = SequencerConfig {
        compaction_interval: 2,
        sync_window: 1,
        ..SequencerConfig::default()
    };
    let (addr, state) = start_server(config).await;
    let head = seed(&state, (0..4).map(|i| create(&format!("t{i}"))).collect()).await;

    let bob = connect(addr, "bob").await;
    wait_until(&bob.view, "bob caught up", |v| v.last_seq == head).await;

    let ada = connect(addr, "ada").await;
    wait_until(&ada.view, "ada caught up", |v| v.last_seq == head).await;
    ada.commands
        .send(NetCommand::Mutate(create("late")))
        .await
        .unwrap();

    wait_until(&bob.view, "bob sees live op", |v| {
        v.last_seq == head + 1 && v.board.task("late").is_some()
    })
    .await;
    assert_eq!(bob.view.read().board, ada.view.read().board);
}
