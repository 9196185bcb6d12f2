// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for automatic reconnection of the live channel.
//!
//! Tests that the `net` supervisor detects a dropped connection, backs off,
//! rejoins, flushes edits made while offline, and catches up on edits other
//! users made in the meantime.
//!
//! ## Disconnect simulation
//!
//! Aborting the server's `JoinHandle` does not close existing WebSocket
//! connections (they run on their own tasks). Instead a TCP proxy sits
//! between the client and the server. Killing the proxy aborts every proxied
//! connection task, which tears down both ends and makes the client see the
//! disconnect. A new proxy on the same port lets the client back in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boardsync::config::ReconnectConfig;
use boardsync::engine::SyncStatus;
use boardsync::net::{self, ClientView, NetCommand, NetConfig, NetEvent, NetHandle, SharedView};
use boardsync_proto::{Column, NewTask, OpKind};
use boardsync_server::auth::{GrantEntry, Role, StaticDirectory, UserEntry};
use boardsync_server::hub::Hub;
use boardsync_server::sequencer::SequencerConfig;
use boardsync_server::server::{self, AppState};
use boardsync_server::storage::MemoryStorage;
use parking_lot::Mutex;
use tokio::sync::mpsc;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards traffic from a client-facing port to the server. `kill()` severs
/// every proxied connection at once.
struct TcpProxy {
    /// The acceptor task handle.
    accept_handle: tokio::task::JoinHandle<()>,
    /// All per-connection task handles. Aborting these kills the TCP streams.
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend: SocketAddr) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((mut client_stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(backend).await
                    else {
                        return;
                    };
                    // No sub-tasks, so aborting this task drops both streams.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            accept_handle,
            conn_handles,
        }
    }

    /// Kills the proxy, severing all connections immediately.
    fn kill(self) {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Finds a free port by binding to 0 and recording the port.
async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

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

/// A config with fast reconnect settings for testing.
fn fast_config(addr: &str, name: &str, max_attempts: u32) -> NetConfig {
    let mut config = NetConfig::new(format!("ws://{addr}"), "w".into(), format!("tok-{name}"));
    config.connect_timeout = Duration::from_secs(2);
    config.sync_timeout = Duration::from_secs(2);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(500),
        max_attempts,
        stability_threshold: Duration::from_secs(30),
        message_queue_cap: 100,
    };
    config
}

async fn connect(addr: &str, name: &str, max_attempts: u32) -> NetHandle {
    net::spawn_net(fast_config(addr, name, max_attempts))
        .await
        .expect("client failed to connect")
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

/// Waits for an event matching `pred`, skipping the rest. Panics on timeout
/// or channel close.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<NetEvent>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> NetEvent
where
    F: Fn(&NetEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
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

async fn wait_for_connected(rx: &mut mpsc::Receiver<NetEvent>) {
    wait_for_event(
        rx,
        Duration::from_secs(15),
        "ConnectionStatus { connected: true }",
        |evt| matches!(evt, NetEvent::ConnectionStatus { connected: true }),
    )
    .await;
}

async fn wait_for_disconnected(rx: &mut mpsc::Receiver<NetEvent>) {
    wait_for_event(
        rx,
        Duration::from_secs(10),
        "ConnectionStatus { connected: false }",
        |evt| matches!(evt, NetEvent::ConnectionStatus { connected: false }),
    )
    .await;
}

async fn wait_until<F>(view: &SharedView, description: &str, pred: F)
where
    F: Fn(&ClientView) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
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

/// After the connection is severed and the proxy comes back, the supervisor
/// rejoins on its own.
#[tokio::test]
async fn reconnects_after_connection_loss() {
    let server_addr = start_server().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, server_addr).await;
    let mut ada = connect(&format!("127.0.0.1:{proxy_port}"), "ada", 10).await;
    wait_for_connected(&mut ada.events).await;

    proxy.kill();
    wait_for_disconnected(&mut ada.events).await;
    assert_eq!(ada.view.read().status, SyncStatus::Offline);

    let evt = wait_for_event(&mut ada.events, Duration::from_secs(10), "Reconnecting", |e| {
        matches!(e, NetEvent::Reconnecting { .. })
    })
    .await;
    assert_eq!(
        evt,
        NetEvent::Reconnecting {
            attempt: 1,
            max_attempts: 10
        }
    );

    let _proxy2 = TcpProxy::new(proxy_port, server_addr).await;
    wait_for_connected(&mut ada.events).await;
    wait_until(&ada.view, "ada synced", |v| v.status == SyncStatus::Synced).await;
}

/// Edits made offline are kept, sent on rejoin, and merged with what other
/// users did in the meantime.
#[tokio::test]
async fn offline_edits_flush_after_reconnect() {
    let server_addr = start_server().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, server_addr).await;
    let mut ada = connect(&format!("127.0.0.1:{proxy_port}"), "ada", 10).await;
    let bob = connect(&server_addr.to_string(), "bob", 10).await;

    ada.commands
        .send(NetCommand::Mutate(create("a1")))
        .await
        .unwrap();
    wait_until(&bob.view, "bob sees a1", |v| v.last_seq == 1).await;

    proxy.kill();
    wait_for_disconnected(&mut ada.events).await;

    ada.commands
        .send(NetCommand::Mutate(create("a2")))
        .await
        .unwrap();
    bob.commands
        .send(NetCommand::Mutate(create("b1")))
        .await
        .unwrap();
    wait_until(&ada.view, "a2 applied offline", |v| {
        v.pending == 1 && v.board.task("a2").is_some()
    })
    .await;
    wait_until(&bob.view, "bob sees b1", |v| v.last_seq == 2 && v.pending == 0).await;
    assert!(ada.view.read().board.task("b1").is_none());

    let _proxy2 = TcpProxy::new(proxy_port, server_addr).await;
    wait_for_connected(&mut ada.events).await;
    let caught_up = wait_for_event(&mut ada.events, Duration::from_secs(10), "CaughtUp", |e| {
        matches!(e, NetEvent::CaughtUp { .. })
    })
    .await;
    assert_eq!(
        caught_up,
        NetEvent::CaughtUp {
            last_seq: 3,
            from_snapshot: false
        }
    );

    let converged = |v: &ClientView| v.last_seq == 3 && v.pending == 0 && v.status == SyncStatus::Synced;
    wait_until(&ada.view, "ada converged", converged).await;
    wait_until(&bob.view, "bob converged", converged).await;
    assert_eq!(ada.view.read().board, bob.view.read().board);
    for id in ["a1", "a2", "b1"] {
        assert!(ada.view.read().board.task(id).is_some(), "missing {id}");
    }
}

/// When every attempt fails the supervisor gives up but keeps queueing
/// edits, and a manual reconnect delivers them.
#[tokio::test]
async fn gives_up_then_reconnects_on_request() {
    let server_addr = start_server().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, server_addr).await;
    let mut ada = connect(&format!("127.0.0.1:{proxy_port}"), "ada", 3).await;
    wait_for_connected(&mut ada.events).await;

    proxy.kill();
    let mut attempts = Vec::new();
    loop {
        let evt = wait_for_event(&mut ada.events, Duration::from_secs(15), "reconnect events", |e| {
            matches!(e, NetEvent::Reconnecting { .. } | NetEvent::ReconnectFailed)
        })
        .await;
        match evt {
            NetEvent::Reconnecting { attempt, .. } => attempts.push(attempt),
            NetEvent::ReconnectFailed => break,
            _ => unreachable!(),
        }
    }
    assert_eq!(attempts, [1, 2, 3]);

    ada.commands
        .send(NetCommand::Mutate(create("queued")))
        .await
        .unwrap();
    wait_until(&ada.view, "edit queued", |v| v.pending == 1).await;

    let _proxy2 = TcpProxy::new(proxy_port, server_addr).await;
    ada.commands.send(NetCommand::Reconnect).await.unwrap();
    wait_for_connected(&mut ada.events).await;
    wait_until(&ada.view, "queued edit committed", |v| {
        v.last_seq == 1 && v.pending == 0 && v.board.task("queued").is_some()
    })
    .await;
}

/// Shutdown while backing off stops the supervisor and closes the event
/// channel.
#[tokio::test]
async fn shutdown_during_reconnect() {
    let server_addr = start_server().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, server_addr).await;
    let mut ada = connect(&format!("127.0.0.1:{proxy_port}"), "ada", 10).await;
    wait_for_connected(&mut ada.events).await;

    proxy.kill();
    wait_for_event(&mut ada.events, Duration::from_secs(10), "Reconnecting", |e| {
        matches!(e, NetEvent::Reconnecting { .. })
    })
    .await;
    ada.commands.send(NetCommand::Shutdown).await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while ada.events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "event channel should close after shutdown");
}
