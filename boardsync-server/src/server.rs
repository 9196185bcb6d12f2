//! HTTP and WebSocket surface.
//!
//! Routes:
//! - `GET /live` upgrades to the live channel. The first frame must be
//!   [`ClientMessage::Join`].
//! - `POST /ops` appends one operation: `{workspace_id, op}` → `{ok, seq}`.
//! - `GET /sync?workspace_id&since` returns an op range or a snapshot.
//! - `GET /state?workspace_id` returns the board at the current head.
//! - `GET /health` returns `ok`.
//!
//! HTTP endpoints authenticate with `Authorization: Bearer <token>`. The
//! submitting user always overwrites `op.client_id`.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use boardsync_proto::codec;
use boardsync_proto::live::{self, ClientMessage, Peer, ServerMessage, SyncResponse};
use boardsync_proto::op::{LogEntry, Operation, Snapshot};
use boardsync_proto::BoardState;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::auth::{AccessControl, AuthError, Identity, IdentityVerifier, Role, StaticDirectory};
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::sequencer::{SequencerError, SequencerHandle, SessionId};
use crate::storage::{FileStorage, MemoryStorage, Storage, StorageError};

/// Shared server state.
pub struct AppState {
    hub: Hub,
    identity: Arc<dyn IdentityVerifier>,
    access: Arc<dyn AccessControl>,
    max_frame_size: usize,
}

impl AppState {
    /// Assembles state from its collaborators.
    #[must_use]
    pub fn new(
        hub: Hub,
        identity: Arc<dyn IdentityVerifier>,
        access: Arc<dyn AccessControl>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            hub,
            identity,
            access,
            max_frame_size,
        }
    }

    /// Builds state from a resolved config: file storage when `data_dir` is
    /// set, memory otherwise, and a [`StaticDirectory`] from the user and
    /// grant tables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the data directory cannot be opened.
    pub fn from_config(config: &ServerConfig) -> Result<Self, StorageError> {
        let storage: Arc<dyn Storage> = match &config.data_dir {
            Some(dir) => {
                tracing::info!(data_dir = %dir.display(), "using file storage");
                Arc::new(FileStorage::open(dir)?)
            }
            None => {
                tracing::info!("using in-memory storage");
                Arc::new(MemoryStorage::new())
            }
        };
        let directory = Arc::new(StaticDirectory::new(&config.users, &config.grants));
        Ok(Self::new(
            Hub::new(storage, config.sequencer()),
            directory.clone(),
            directory,
            config.max_frame_size,
        ))
    }

    /// The sequencer registry.
    #[must_use]
    pub const fn hub(&self) -> &Hub {
        &self.hub
    }

    fn authorize(&self, workspace: &str, token: &str) -> Result<(Identity, Role), ApiError> {
        let identity = self.identity.verify(token)?;
        let role = self.access.role(workspace, &identity.user_id);
        if !role.can_read() {
            return Err(ApiError::NotFound);
        }
        Ok((identity, role))
    }
}

// ---------------------------------------------------------------------------
// HTTP errors
// ---------------------------------------------------------------------------

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid bearer token.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// The user may read but not write.
    #[error("read-only access to workspace")]
    Forbidden,
    /// The user has no access; indistinguishable from a missing workspace.
    #[error("workspace not found")]
    NotFound,
    /// The request body or query is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The sequencer refused or failed.
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    /// Storage failed outside a sequencer.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Sequencer(SequencerError::Rejected(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Sequencer(SequencerError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Sequencer(SequencerError::Storage(_)) | Self::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({ "ok": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

/// Body of `POST /ops`.
#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitRequest {
    /// Target workspace.
    pub workspace_id: String,
    /// Operation to append.
    pub op: Operation,
}

/// Response of `POST /ops`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SubmitResponse {
    /// Always `true` on success.
    pub ok: bool,
    /// Assigned (or existing) sequence.
    pub seq: u64,
}

/// Query of `GET /sync`.
#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    /// Workspace to read.
    pub workspace_id: String,
    /// The caller's `lastSeq`; 0 if absent.
    #[serde(default)]
    pub since: u64,
}

/// Query of `GET /state`.
#[derive(Debug, Deserialize)]
pub struct StateQuery {
    /// Workspace to read.
    pub workspace_id: String,
}

/// JSON shape of a catch-up response.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SyncBody {
    /// Ordered entries after `since`.
    Ops {
        /// Entries in ascending `seq`.
        ops: Vec<LogEntry>,
        /// Log head.
        maxseq: u64,
    },
    /// Full board at `base_seq`.
    Snapshot {
        /// Board state.
        tabs: BoardState,
        /// Sequence the board reflects.
        base_seq: u64,
    },
}

impl From<SyncResponse> for SyncBody {
    fn from(resp: SyncResponse) -> Self {
        match resp {
            SyncResponse::Ops { ops, maxseq } => Self::Ops { ops, maxseq },
            SyncResponse::Snapshot(Snapshot { board, base_seq }) => Self::Snapshot {
                tabs: board,
                base_seq,
            },
        }
    }
}

async fn submit_op(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(SubmitRequest {
        workspace_id,
        mut op,
    }) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let (identity, role) = state.authorize(&workspace_id, bearer(&headers)?)?;
    if !role.can_write() {
        return Err(ApiError::Forbidden);
    }
    op.client_id = identity.user_id;
    let seq = state.hub.sequencer(&workspace_id)?.append(op).await?;
    Ok(Json(SubmitResponse { ok: true, seq }))
}

async fn sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncBody>, ApiError> {
    state.authorize(&query.workspace_id, bearer(&headers)?)?;
    let resp = state
        .hub
        .sequencer(&query.workspace_id)?
        .sync(query.since)
        .await?;
    Ok(Json(resp.into()))
}

async fn get_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StateQuery>,
) -> Result<Json<Snapshot>, ApiError> {
    state.authorize(&query.workspace_id, bearer(&headers)?)?;
    let snapshot = state.hub.sequencer(&query.workspace_id)?.snapshot().await?;
    Ok(Json(snapshot))
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Live channel
// ---------------------------------------------------------------------------

/// Optional query on `/live`; when present it must match the `Join` frame.
#[derive(Debug, Deserialize)]
struct LiveQuery {
    workspace: Option<String>,
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn live_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveQuery>,
) -> impl IntoResponse {
    let limit = state.max_frame_size;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, query.workspace))
}

/// An authenticated live-channel session.
struct SessionCtx {
    id: SessionId,
    user_id: String,
    role: Role,
    sequencer: SequencerHandle,
    /// The session's own outbound channel, for replies that need no actor.
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Handles an upgraded WebSocket connection for a single session.
///
/// The connection lifecycle:
/// 1. Wait for a `Join` frame and authenticate it.
/// 2. Register with the workspace sequencer, which queues `Hello`.
/// 3. Forward frames to the sequencer until either side closes.
/// 4. Unregister, which may announce presence leave.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, requested: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some((workspace, token)) = wait_for_join(&mut ws_receiver, state.max_frame_size).await
    else {
        tracing::warn!("connection closed before join");
        return;
    };

    let admitted = admit(&state, requested.as_deref(), &workspace, &token);
    let (identity, role, sequencer) = match admitted {
        Ok(v) => v,
        Err(reason) => {
            tracing::warn!(workspace = %workspace, reason = %reason, "join refused");
            let _ = send_direct(&mut ws_sender, &ServerMessage::Error { reason }).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let ctx = SessionCtx {
        id: SessionId::new(),
        user_id: identity.user_id.clone(),
        role,
        sequencer,
        tx: tx.clone(),
    };
    let peer = Peer {
        user_id: identity.user_id,
        name: identity.name,
        email: identity.email,
    };
    if ctx.sequencer.join(ctx.id, peer, tx).is_err() {
        tracing::error!(workspace = %workspace, "sequencer unavailable at join");
        return;
    }

    // Writer: drain the session channel onto the socket.
    let writer_session = ctx.id;
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_direct(&mut ws_sender, &msg).await {
                tracing::warn!(session = %writer_session, error = %e, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader: decode client frames and hand them to the sequencer.
    let max_frame_size = state.max_frame_size;
    let session_id = ctx.id;
    let sequencer = ctx.sequencer.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    match codec::decode_bounded::<ClientMessage>(&data, max_frame_size) {
                        Ok(client_msg) => {
                            if handle_client_message(&ctx, client_msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(session = %ctx.id, error = %e, "malformed frame");
                        }
                    }
                }
                Message::Close(_) => {
                    tracing::debug!(session = %ctx.id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    sequencer.leave(session_id);
}

/// Authenticates a join and resolves the workspace sequencer.
fn admit(
    state: &AppState,
    requested: Option<&str>,
    workspace: &str,
    token: &str,
) -> Result<(Identity, Role, SequencerHandle), String> {
    if requested.is_some_and(|r| r != workspace) {
        return Err("workspace in join does not match connection".to_string());
    }
    let (identity, role) = state
        .authorize(workspace, token)
        .map_err(|e| e.to_string())?;
    let sequencer = state
        .hub
        .sequencer(workspace)
        .map_err(|e| format!("workspace unavailable: {e}"))?;
    Ok((identity, role, sequencer))
}

/// Routes one decoded client frame.
fn handle_client_message(ctx: &SessionCtx, msg: ClientMessage) -> Result<(), SequencerError> {
    match msg {
        ClientMessage::Join { workspace, .. } => {
            tracing::warn!(session = %ctx.id, workspace = %workspace, "duplicate join ignored");
            Ok(())
        }
        ClientMessage::Submit { mut op } => {
            if !ctx.role.can_write() {
                let _ = ctx.tx.send(ServerMessage::Rejected {
                    op_id: op.op_id,
                    reason: ApiError::Forbidden.to_string(),
                });
                return Ok(());
            }
            // Server-side identity enforcement: never trust the client's id.
            op.client_id.clone_from(&ctx.user_id);
            ctx.sequencer.submit(ctx.id, op)
        }
        ClientMessage::SyncRequest { since } => ctx.sequencer.request_sync(ctx.id, since),
        ClientMessage::SnapshotRequest => ctx.sequencer.request_snapshot(ctx.id),
        ClientMessage::AwareUpdate {
            task_id,
            caret_start,
            caret_end,
            color,
        } => ctx
            .sequencer
            .aware_update(ctx.id, task_id, caret_start, caret_end, color),
        ClientMessage::AwareBlur => ctx.sequencer.aware_blur(ctx.id),
        ClientMessage::Delta {
            task_id,
            field,
            value,
        } => ctx.sequencer.delta(ctx.id, task_id, field, value),
    }
}

/// Waits for the first binary frame, expecting a `Join`.
///
/// Returns `(workspace, token)`, or `None` if the connection closes or an
/// invalid message arrives.
async fn wait_for_join(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    max_frame_size: usize,
) -> Option<(String, String)> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match codec::decode_bounded::<ClientMessage>(&data, max_frame_size) {
                    Ok(ClientMessage::Join { workspace, token }) if !workspace.is_empty() => {
                        Some((workspace, token))
                    }
                    Ok(other) => {
                        tracing::warn!(msg = ?other, "expected Join, got different message");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode join message");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => {
                // Skip non-binary frames (ping/pong) before join.
            }
        }
    }
    None
}

/// Encodes and sends a server message directly on a WebSocket sender.
async fn send_direct(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &ServerMessage,
) -> Result<(), String> {
    let bytes = live::encode_server(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Builds the router for `state`.
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/live", get(live_handler))
        .route("/ops", post(submit_op))
        .route("/sync", get(sync))
        .route("/state", get(get_state))
        .route("/health", get(health))
        .with_state(state)
}

/// Starts the server with a pre-configured [`AppState`] and returns the
/// bound address.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<AppState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the server from a resolved config.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or the listener cannot bind.
pub async fn start_server(
    config: &ServerConfig,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let state = Arc::new(AppState::from_config(config)?);
    start_server_with_state(&config.bind_addr, state).await
}
