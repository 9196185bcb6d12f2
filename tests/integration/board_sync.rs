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

//! Integration tests for live board editing between clients.
//!
//! A real server runs on an OS-assigned port with in-memory storage. Clients
//! connect through `spawn_net` and edit the board; the tests check that every
//! client converges on the server's materialized board, and that refused
//! edits are rolled back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boardsync::net::{self, ClientView, NetCommand, NetConfig, NetEvent, NetHandle, SharedView};
use boardsync_proto::{BoardState, Column, NewTask, OpKind};
use boardsync_server::auth::{GrantEntry, Role, StaticDirectory, UserEntry};
use boardsync_server::hub::Hub;
use boardsync_server::sequencer::SequencerConfig;
use boardsync_server::server::{self, AppState};
use boardsync_server::storage::MemoryStorage;
use tokio::sync::mpsc;

// =============================================================================
// Helpers
// =============================================================================

fn user(name: &str) -> UserEntry {
    UserEntry {
        token: format!("tok-{name}"),
        user_id: name.to_string(),
        name: name.to_string(),
        email: format!("{name}@example.com"),
    }
}

fn grant(user_id: &str, role: Role) -> GrantEntry {
    GrantEntry {
        workspace: "w".to_string(),
        user_id: user_id.to_string(),
        role,
    }
}

/// Starts a server where ada and bob are editors and vic is a viewer.
async fn start_server() -> (SocketAddr, Arc<AppState>) {
    let directory = Arc::new(StaticDirectory::new(
        &[user("ada"), user("bob"), user("vic")],
        &[
            grant("ada", Role::Editor),
            grant("bob", Role::Editor),
            grant("vic", Role::Viewer),
        ],
    ));
    let hub = Hub::new(Arc::new(MemoryStorage::new()), SequencerConfig::default());
    let state = Arc::new(AppState::new(
        hub,
        directory.clone(),
        directory,
        256 * 1024,
    ));
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

fn create(tab: &str, id: &str, pos: f64) -> OpKind {
    OpKind::CreateTask {
        tab: tab.to_string(),
        column: Some(Column::Todo),
        task: NewTask {
            id: id.to_string(),
            content: format!("task {id}"),
            due_date: String::new(),
            priority: None,
            pos,
            upd: None,
            by: None,
        },
    }
}

/// Polls the shared view until `pred` holds. Panics after 10 seconds.
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

async fn wait_for_event<F>(rx: &mut mpsc::Receiver<NetEvent>, description: &str, pred: F) -> NetEvent
where
    F: Fn(&NetEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

fn settled(view: &ClientView, seq: u64) -> bool {
    view.last_seq == seq && view.pending == 0
}

fn todo_ids(board: &BoardState, tab: &str) -> Vec<String> {
    board
        .tab(tab)
        .map(|t| t.todo.iter().map(|task| task.id.clone()).collect())
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

/// Concurrent creates from two clients end up in one order everywhere.
#[tokio::test]
async fn two_clients_converge_on_server_board() {
    let (addr, state) = start_server().await;
    let ada = connect(addr, "ada").await;
    let bob = connect(addr, "bob").await;

    for i in 0..3 {
        ada.commands
            .send(NetCommand::Mutate(create("Main", &format!("a{i}"), 1.0)))
            .await
            .unwrap();
        bob.commands
            .send(NetCommand::Mutate(create("Main", &format!("b{i}"), 1.0)))
            .await
            .unwrap();
    }

    wait_until(&ada.view, "ada settled", |v| settled(v, 6)).await;
    wait_until(&bob.view, "bob settled", |v| settled(v, 6)).await;

    let snapshot = state
        .hub()
        .sequencer("w")
        .unwrap()
        .snapshot()
        .await
        .unwrap();
    assert_eq!(snapshot.base_seq, 6);
    assert_eq!(snapshot.board.task_count(), 6);
    assert_eq!(ada.view.read().board, snapshot.board);
    assert_eq!(bob.view.read().board, snapshot.board);
}

/// A client's own edits are applied immediately and then committed.
#[tokio::test]
async fn local_edit_is_applied_then_committed() {
    let (addr, _state) = start_server().await;
    let mut ada = connect(addr, "ada").await;

    ada.commands
        .send(NetCommand::Mutate(create("Main", "t1", 1.0)))
        .await
        .unwrap();

    let NetEvent::Applied { op_id } =
        wait_for_event(&mut ada.events, "Applied", |e| matches!(e, NetEvent::Applied { .. })).await
    else {
        unreachable!()
    };
    let committed = wait_for_event(&mut ada.events, "Committed", |e| {
        matches!(e, NetEvent::Committed { .. })
    })
    .await;
    assert_eq!(committed, NetEvent::Committed { op_id });
    wait_until(&ada.view, "ada settled", |v| settled(v, 1)).await;
    assert_eq!(todo_ids(&ada.view.read().board, "Main"), ["t1"]);
}

/// Moves and tab renames propagate to the other client.
#[tokio::test]
async fn move_and_rename_propagate() {
    let (addr, _state) = start_server().await;
    let ada = connect(addr, "ada").await;
    let bob = connect(addr, "bob").await;

    ada.commands
        .send(NetCommand::Mutate(create("Main", "t1", 1.0)))
        .await
        .unwrap();
    ada.commands
        .send(NetCommand::Mutate(OpKind::MoveTask {
            task_id: "t1".into(),
            to: Column::Done,
            pos: 1.0,
        }))
        .await
        .unwrap();
    ada.commands
        .send(NetCommand::Mutate(OpKind::RenameTab {
            from: "Main".into(),
            to: "Sprint".into(),
        }))
        .await
        .unwrap();

    wait_until(&bob.view, "bob sees rename", |v| settled(v, 3)).await;
    let view = bob.view.read();
    assert!(view.board.tab("Main").is_none());
    let tab = view.board.tab("Sprint").expect("renamed tab");
    assert!(tab.todo.is_empty());
    assert_eq!(tab.column(Column::Done)[0].id, "t1");
    drop(view);
    assert_eq!(ada.view.read().board, bob.view.read().board);
}

/// A viewer's edit is refused by the server and rolled back locally.
#[tokio::test]
async fn viewer_edit_is_rejected_and_rolled_back() {
    let (addr, _state) = start_server().await;
    let ada = connect(addr, "ada").await;
    let mut vic = connect(addr, "vic").await;

    ada.commands
        .send(NetCommand::Mutate(create("Main", "a1", 1.0)))
        .await
        .unwrap();
    wait_until(&vic.view, "vic sees ada's task", |v| settled(v, 1)).await;

    vic.commands
        .send(NetCommand::Mutate(create("Main", "v1", 2.0)))
        .await
        .unwrap();
    let rejected = wait_for_event(&mut vic.events, "Rejected", |e| {
        matches!(e, NetEvent::Rejected { .. })
    })
    .await;
    let NetEvent::Rejected { reason, .. } = rejected else {
        unreachable!()
    };
    assert!(!reason.is_empty());

    wait_until(&vic.view, "vic rolled back", |v| {
        v.pending == 0 && v.board.task("v1").is_none()
    })
    .await;
    assert_eq!(todo_ids(&vic.view.read().board, "Main"), ["a1"]);
    assert_eq!(ada.view.read().board.task("v1"), None);
}

/// Deleting an unknown task is sequenced as a no-op.
#[tokio::test]
async fn delete_of_unknown_task_is_a_noop() {
    let (addr, state) = start_server().await;
    let ada = connect(addr, "ada").await;

    ada.commands
        .send(NetCommand::Mutate(OpKind::DeleteTask {
            task_id: "missing".into(),
        }))
        .await
        .unwrap();
    wait_until(&ada.view, "ada settled", |v| settled(v, 1)).await;
    assert!(ada.view.read().board.is_empty());

    let snapshot = state
        .hub()
        .sequencer("w")
        .unwrap()
        .snapshot()
        .await
        .unwrap();
    assert_eq!(snapshot.base_seq, 1);
    assert!(snapshot.board.is_empty());
}
