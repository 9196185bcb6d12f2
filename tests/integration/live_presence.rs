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

//! Integration tests for the ephemeral side of the live channel: who is
//! online, where their caret is, and what they are typing.
//!
//! None of this touches the operation log; the tests check it reaches the
//! other client and is cleaned up when a user blurs or leaves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boardsync::net::{self, ClientView, NetCommand, NetConfig, NetEvent, NetHandle, SharedView};
use boardsync::presence::color_for;
use boardsync_proto::TaskField;
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
        name: format!("{name} (display)"),
        email: format!("{name}@example.com"),
    }
}

fn editor(user_id: &str) -> GrantEntry {
    GrantEntry {
        workspace: "w".to_string(),
        user_id: user_id.to_string(),
        role: Role::Editor,
    }
}

async fn start_server() -> SocketAddr {
    let directory = Arc::new(StaticDirectory::new(
        &[user("ada"), user("bob")],
        &[editor("ada"), editor("bob")],
    ));
    let hub = Hub::new(Arc::new(MemoryStorage::new()), SequencerConfig::default());
    let state = Arc::new(AppState::new(hub, directory.clone(), directory, 256 * 1024));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start server");
    addr
}

async fn connect(addr: SocketAddr, name: &str) -> NetHandle {
    let mut config = NetConfig::new(format!("ws://{addr}"), "w".into(), format!("tok-{name}"));
    config.delta_interval = Duration::from_millis(100);
    net::spawn_net(config).await.expect("client failed to connect")
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

/// Joins and leaves are announced to the users already online.
#[tokio::test]
async fn presence_join_and_leave() {
    let addr = start_server().await;
    let mut ada = connect(addr, "ada").await;
    wait_until(&ada.view, "ada welcomed", |v| v.roster.you().is_some()).await;
    assert_eq!(ada.view.read().roster.online().count(), 0);

    let mut bob = connect(addr, "bob").await;
    let online = match wait_for_event(&mut bob.events, "Welcome", |e| {
        matches!(e, NetEvent::Welcome { .. })
    })
    .await
    {
        NetEvent::Welcome { you, online, .. } => {
            assert_eq!(you.user_id, "bob");
            assert_eq!(you.name, "bob (display)");
            online
        }
        _ => unreachable!(),
    };
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].user_id, "ada");

    let joined = wait_for_event(&mut ada.events, "PresenceJoined", |e| {
        matches!(e, NetEvent::PresenceJoined(_))
    })
    .await;
    let NetEvent::PresenceJoined(peer) = joined else {
        unreachable!()
    };
    assert_eq!(peer.user_id, "bob");
    assert!(ada.view.read().roster.is_online("bob"));

    bob.commands.send(NetCommand::Shutdown).await.unwrap();
    let left = wait_for_event(&mut ada.events, "PresenceLeft", |e| {
        matches!(e, NetEvent::PresenceLeft { .. })
    })
    .await;
    assert_eq!(
        left,
        NetEvent::PresenceLeft {
            user_id: "bob".into()
        }
    );
    assert!(!ada.view.read().roster.is_online("bob"));
}

/// Caret positions reach the other user and disappear on blur.
#[tokio::test]
async fn awareness_is_shared_and_cleared_on_blur() {
    let addr = start_server().await;
    let ada = connect(addr, "ada").await;
    let bob = connect(addr, "bob").await;
    wait_until(&ada.view, "ada sees bob", |v| v.roster.is_online("bob")).await;

    bob.commands
        .send(NetCommand::Aware {
            task_id: "t1".into(),
            caret_start: 2,
            caret_end: 5,
        })
        .await
        .unwrap();

    wait_until(&ada.view, "bob's caret", |v| v.roster.editors_of("t1").count() == 1).await;
    {
        let view = ada.view.read();
        let entry = view.roster.editors_of("t1").next().unwrap();
        assert_eq!(entry.user_id, "bob");
        assert_eq!(entry.name, "bob (display)");
        assert_eq!((entry.caret_start, entry.caret_end), (2, 5));
        assert_eq!(entry.color, color_for("bob"));
    }
    // The sender is not echoed its own awareness.
    assert!(bob.view.read().roster.awareness().is_empty());

    bob.commands.send(NetCommand::Blur).await.unwrap();
    wait_until(&ada.view, "bob's caret cleared", |v| {
        v.roster.awareness().is_empty()
    })
    .await;
}

/// A user leaving takes their caret with them.
#[tokio::test]
async fn awareness_is_dropped_when_user_leaves() {
    let addr = start_server().await;
    let ada = connect(addr, "ada").await;
    let bob = connect(addr, "bob").await;
    wait_until(&ada.view, "ada sees bob", |v| v.roster.is_online("bob")).await;

    bob.commands
        .send(NetCommand::Aware {
            task_id: "t1".into(),
            caret_start: 0,
            caret_end: 0,
        })
        .await
        .unwrap();
    wait_until(&ada.view, "bob's caret", |v| !v.roster.awareness().is_empty()).await;

    bob.commands.send(NetCommand::Shutdown).await.unwrap();
    wait_until(&ada.view, "bob gone", |v| {
        !v.roster.is_online("bob") && v.roster.awareness().is_empty()
    })
    .await;
}

/// A burst of drafts is thinned out; the last value always arrives.
#[tokio::test]
async fn delta_burst_delivers_latest_value() {
    let addr = start_server().await;
    let mut ada = connect(addr, "ada").await;
    let bob = connect(addr, "bob").await;
    wait_until(&ada.view, "ada sees bob", |v| v.roster.is_online("bob")).await;

    for value in ["h", "he", "hel", "hell", "hello"] {
        bob.commands
            .send(NetCommand::Delta {
                task_id: "t1".into(),
                field: TaskField::Content,
                value: value.into(),
            })
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    loop {
        let event = wait_for_event(&mut ada.events, "Delta", |e| {
            matches!(e, NetEvent::Delta { .. })
        })
        .await;
        let NetEvent::Delta {
            by,
            task_id,
            field,
            value,
        } = event
        else {
            unreachable!()
        };
        assert_eq!(by, "bob");
        assert_eq!(task_id, "t1");
        assert_eq!(field, TaskField::Content);
        let done = value == "hello";
        seen.push(value);
        if done {
            break;
        }
    }
    assert!(seen.len() < 5, "burst was not throttled: {seen:?}");
    assert_eq!(seen[0], "h");
}
