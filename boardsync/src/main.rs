//! `boardsync` -- command-line client for synchronized task boards.
//!
//! Connects to a boardsync server, catches up on the workspace log, and
//! either follows live changes or performs a single edit and waits for the
//! server to sequence it. Configuration via CLI flags, environment variables,
//! or config file (`~/.config/boardsync/config.toml`).
//!
//! ```bash
//! # Follow a workspace
//! cargo run --bin boardsync -- --server-url ws://127.0.0.1:9000 \
//!     --workspace team --token tok-ada watch
//!
//! # One-shot edits
//! BOARDSYNC_SERVER=ws://127.0.0.1:9000 BOARDSYNC_WORKSPACE=team BOARDSYNC_TOKEN=tok-ada \
//!     cargo run --bin boardsync -- create "Write release notes" --tab Sprint
//! ```

use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;

use boardsync::config::{CliArgs, ClientConfig};
use boardsync::engine::SyncStatus;
use boardsync::net::{self, ClientView, NetCommand, NetEvent, NetHandle};
use boardsync_proto::op::new_op_id;
use boardsync_proto::reduce::DEFAULT_TAB;
use boardsync_proto::{Column, NewTask, OpKind, Priority, TaskField};

/// How long a one-shot command waits for catch-up and for its echo.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(version, about = "Real-time synchronized task boards")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the board, then follow live changes, presence and edits.
    Watch {
        /// Print the board as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the current board and exit.
    Show {
        /// Print the board as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Add a task at the end of a column.
    Create {
        /// Task text.
        content: String,
        /// Tab to add to; created if missing.
        #[arg(long, default_value = DEFAULT_TAB)]
        tab: String,
        /// Column to add to.
        #[arg(long, default_value_t = Column::Todo)]
        column: Column,
        /// Due date, `YYYY-MM-DD`.
        #[arg(long)]
        due: Option<String>,
        /// `High`, `Medium` or `Low`.
        #[arg(long)]
        priority: Option<Priority>,
        /// Task id; generated if omitted.
        #[arg(long)]
        id: Option<String>,
    },
    /// Set one field of a task.
    Update {
        /// Task id.
        task_id: String,
        /// Field to set.
        field: FieldArg,
        /// New value.
        value: String,
    },
    /// Move a task to the end of another column.
    Move {
        /// Task id.
        task_id: String,
        /// Destination column.
        to: Column,
    },
    /// Delete a task.
    Delete {
        /// Task id.
        task_id: String,
    },
    /// Rename a tab.
    Rename {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FieldArg {
    Content,
    DueDate,
    Priority,
}

impl From<FieldArg> for TaskField {
    fn from(field: FieldArg) -> Self {
        match field {
            FieldArg::Content => Self::Content,
            FieldArg::DueDate => Self::DueDate,
            FieldArg::Priority => Self::Priority,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.args.log_level, cli.args.log_file.as_deref());

    let config = match ClientConfig::load(&cli.args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let net_config = match config.to_net_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut handle = match net::spawn_net(net_config).await {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Could not connect: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Watch { json } => watch(&mut handle, json).await,
        Command::Show { json } => show(&mut handle, json).await,
        other => match wait_synced(&mut handle)
            .await
            .and_then(|()| build_op(other, &handle))
        {
            Ok(kind) => mutate(&mut handle, kind).await,
            Err(e) => Err(e),
        },
    };

    let _ = handle.commands.send(NetCommand::Shutdown).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging to stderr, or to `file_path` when given.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = log_path.file_name()?.to_str()?;
    let file_appender =
        tracing_appender::rolling::never(log_dir.unwrap_or_else(|| Path::new(".")), file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Waits until the client has caught up to the head it saw on joining.
async fn wait_synced(handle: &mut NetHandle) -> Result<(), String> {
    let mut head = None;
    tokio::time::timeout(COMMAND_TIMEOUT, async {
        loop {
            if let Some(maxseq) = head {
                let view = handle.view.read();
                if view.status == SyncStatus::Synced && view.last_seq >= maxseq {
                    return Ok(());
                }
            }
            match handle.events.recv().await {
                Some(NetEvent::Welcome { maxseq, .. }) => head = Some(maxseq),
                Some(NetEvent::ReconnectFailed) | None => {
                    return Err("connection lost before the board was loaded".to_string());
                }
                Some(_) => {}
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for the board to load".to_string())?
}

async fn show(handle: &mut NetHandle, json: bool) -> Result<(), String> {
    wait_synced(handle).await?;
    let view = handle.view.read().clone();
    println!("{}", render(&view, json)?);
    Ok(())
}

async fn watch(handle: &mut NetHandle, json: bool) -> Result<(), String> {
    wait_synced(handle).await?;
    println!("{}", render(&handle.view.read().clone(), json)?);

    while let Some(event) = handle.events.recv().await {
        match event {
            NetEvent::BoardChanged { .. } => {
                let view = handle.view.read().clone();
                println!("{}", render(&view, json)?);
            }
            NetEvent::StatusChanged(status) => println!("-- {status}"),
            NetEvent::ConnectionStatus { connected } => {
                println!("-- {}", if connected { "connected" } else { "disconnected" });
            }
            NetEvent::Reconnecting {
                attempt,
                max_attempts,
            } => println!("-- reconnecting (attempt {attempt}/{max_attempts})"),
            NetEvent::ReconnectFailed => {
                return Err("reconnection failed".to_string());
            }
            NetEvent::PresenceJoined(peer) => println!("+ {} joined", peer.name),
            NetEvent::PresenceLeft { user_id } => println!("- {user_id} left"),
            NetEvent::Awareness(entries) => {
                for e in entries {
                    println!(
                        "  {} editing {} [{}..{}]",
                        e.name, e.task_id, e.caret_start, e.caret_end
                    );
                }
            }
            NetEvent::Delta {
                by,
                task_id,
                field,
                value,
            } => println!("  {by} typing in {task_id}.{field}: {value}"),
            NetEvent::Rejected { op_id, reason } => println!("! {op_id} rejected: {reason}"),
            NetEvent::Error(msg) => println!("! {msg}"),
            NetEvent::Welcome { .. }
            | NetEvent::CaughtUp { .. }
            | NetEvent::Applied { .. }
            | NetEvent::Committed { .. } => {}
        }
    }
    Ok(())
}

/// Turns a mutation subcommand into an operation against the loaded board.
fn build_op(command: Command, handle: &NetHandle) -> Result<OpKind, String> {
    let view = handle.view.read();
    let kind = match command {
        Command::Create {
            content,
            tab,
            column,
            due,
            priority,
            id,
        } => {
            let pos = view.end_position(&tab, column);
            OpKind::CreateTask {
                tab,
                column: Some(column),
                task: NewTask {
                    id: id.unwrap_or_else(|| format!("task-{}", new_op_id())),
                    content,
                    due_date: due.unwrap_or_default(),
                    priority,
                    pos,
                    upd: None,
                    by: None,
                },
            }
        }
        Command::Update {
            task_id,
            field,
            value,
        } => OpKind::UpdateTaskField {
            task_id,
            field: field.into(),
            value,
        },
        Command::Move { task_id, to } => {
            let loc = view
                .board
                .locate(&task_id)
                .ok_or_else(|| format!("no task {task_id}"))?;
            OpKind::MoveTask {
                pos: view.end_position(&loc.tab, to),
                task_id,
                to,
            }
        }
        Command::Delete { task_id } => OpKind::DeleteTask { task_id },
        Command::Rename { from, to } => OpKind::RenameTab { from, to },
        Command::Watch { .. } | Command::Show { .. } => {
            return Err("not a mutation".to_string());
        }
    };
    Ok(kind)
}

/// Submits one mutation and waits until it is sequenced or refused.
async fn mutate(handle: &mut NetHandle, kind: OpKind) -> Result<(), String> {
    handle
        .commands
        .send(NetCommand::Mutate(kind))
        .await
        .map_err(|_| "client stopped".to_string())?;

    let mut mine = None;
    tokio::time::timeout(COMMAND_TIMEOUT, async {
        while let Some(event) = handle.events.recv().await {
            match event {
                NetEvent::Applied { op_id } if mine.is_none() => mine = Some(op_id),
                NetEvent::Committed { op_id } if mine.as_ref() == Some(&op_id) => {
                    println!("ok {op_id} (seq {})", handle.view.read().last_seq);
                    return Ok(());
                }
                NetEvent::Rejected { op_id, reason } if mine.as_ref() == Some(&op_id) => {
                    return Err(format!("rejected: {reason}"));
                }
                NetEvent::ReconnectFailed => return Err("connection lost".to_string()),
                _ => {}
            }
        }
        Err("client stopped".to_string())
    })
    .await
    .map_err(|_| "timed out waiting for the server".to_string())?
}

fn render(view: &ClientView, json: bool) -> Result<String, String> {
    if json {
        return serde_json::to_string_pretty(&view.board).map_err(|e| e.to_string());
    }

    let mut out = String::new();
    let _ = writeln!(out, "== seq {} ({}) ==", view.last_seq, view.status);
    if view.board.is_empty() {
        out.push_str("(empty board)\n");
    }
    for (name, tab) in view.board.tabs() {
        let _ = writeln!(out, "[{name}]");
        for column in Column::ALL {
            let _ = writeln!(out, "  {column}:");
            for task in tab.column(column) {
                let _ = write!(out, "    {} {} ({})", task.id, task.content, task.priority);
                if let Some(due) = task.due_date {
                    let _ = write!(out, " due {due}");
                }
                for editor in view.roster.editors_of(&task.id) {
                    let _ = write!(out, " <{}>", editor.name);
                }
                out.push('\n');
            }
        }
    }
    if view.pending > 0 {
        let _ = writeln!(out, "{} local edit(s) pending", view.pending);
    }
    let online: Vec<&str> = view.roster.online().map(|p| p.name.as_str()).collect();
    if !online.is_empty() {
        let _ = writeln!(out, "online: {}", online.join(", "));
    }
    Ok(out.trim_end().to_string())
}
