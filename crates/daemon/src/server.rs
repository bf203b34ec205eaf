//! HTTP server: the session WebSocket endpoint and the management API.
//!
//! One WebSocket per session, opened at `/ws` with the target host,
//! container, and mode in the query string. Binary frames carry terminal
//! bytes; text frames carry the JSON control messages defined in the
//! protocol crate. The JSON endpoints under `/api` are the thin
//! request/response surface: hosts, container listing and lifecycle, and
//! session listing/close.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use protocol::{ClientControl, ErrorCode, ErrorMessage, ServerControl, SessionMode};

use crate::config::Config;
use crate::docker::{self, ApiError, ConnectError, ContainerAction, HostRegistry, LogOptions, TtySize};
use crate::hosts::{HostEndpoint, HostStore, TcpTarget, TlsMaterial};
use crate::session::channel::{ClientFrame, ClientSink, ClientSource};
use crate::session::{SessionManager, SessionRequest};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    /// The session manager.
    pub manager: Arc<SessionManager>,
    /// The host endpoint store.
    pub hosts: Arc<HostStore>,
    /// The transport registry (shared with the manager).
    pub registry: HostRegistry,
}

/// Builds the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/hosts", get(list_hosts).post(add_host))
        .route("/api/hosts/:name", delete(remove_host))
        .route("/api/hosts/:name/activate", post(activate_host))
        .route("/api/containers", get(list_containers))
        .route("/api/containers/:id/:action", post(container_action))
        .route("/api/containers/:id", delete(remove_container))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(close_session))
        .route("/ws", get(session_ws))
        .with_state(state)
}

/// Binds the listen address and serves until the token fires.
pub async fn serve(
    config: &Config,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use anyhow::Context;
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    tracing::info!(addr = %config.server.listen, "server listening");

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")
}

// ============================================================================
// Error mapping
// ============================================================================

/// JSON error response wrapper for API handlers.
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.1 }));
        (self.0, body).into_response()
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        let status = match &err {
            ApiError::NoSuchContainer(_) => StatusCode::NOT_FOUND,
            ApiError::NotRunning(_) => StatusCode::CONFLICT,
            ApiError::Connect(_) => StatusCode::BAD_GATEWAY,
            ApiError::Rejected { .. } | ApiError::BadResponse(_) | ApiError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        AppError(status, err.to_string())
    }
}

impl From<ConnectError> for AppError {
    fn from(err: ConnectError) -> Self {
        AppError(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn not_found(what: impl Into<String>) -> AppError {
    AppError(StatusCode::NOT_FOUND, what.into())
}

fn bad_request(what: impl Into<String>) -> AppError {
    AppError(StatusCode::BAD_REQUEST, what.into())
}

// ============================================================================
// Host endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct AddHostBody {
    name: String,
    host: Option<String>,
    port: Option<u16>,
    ca_file: Option<std::path::PathBuf>,
    cert_file: Option<std::path::PathBuf>,
    key_file: Option<std::path::PathBuf>,
}

async fn list_hosts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.hosts.active_name();
    let hosts: Vec<_> = state
        .hosts
        .list()
        .into_iter()
        .map(|h| {
            serde_json::json!({
                "name": h.name,
                "label": h.label(),
                "address": h.address,
                "active": active.as_deref() == Some(h.name.as_str()),
            })
        })
        .collect();
    Json(serde_json::json!({ "hosts": hosts, "active": active }))
}

async fn add_host(
    State(state): State<AppState>,
    Json(body): Json<AddHostBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let address = match (body.host, body.port) {
        (Some(host), Some(port)) => Some(TcpTarget { host, port }),
        (None, None) => None,
        _ => return Err(bad_request("host and port must be provided together")),
    };
    let tls = match (body.cert_file, body.key_file) {
        (Some(cert_file), Some(key_file)) => Some(TlsMaterial {
            ca_file: body.ca_file,
            cert_file,
            key_file,
        }),
        (None, None) => None,
        _ => return Err(bad_request("cert_file and key_file must be provided together")),
    };
    let endpoint = HostEndpoint {
        name: body.name.clone(),
        address,
        tls,
    };
    state.hosts.add(endpoint)?;
    Ok(Json(serde_json::json!({ "added": body.name })))
}

async fn remove_host(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.hosts.remove(&name)? {
        return Err(not_found(format!("no host named '{name}'")));
    }
    // The stored config is gone; do not reuse its cached transport.
    state.registry.evict(&name);
    Ok(Json(serde_json::json!({ "removed": name })))
}

async fn activate_host(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.hosts.set_active(&name)? {
        return Err(not_found(format!("no host named '{name}'")));
    }
    Ok(Json(serde_json::json!({ "active": name })))
}

// ============================================================================
// Container endpoints
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct HostQuery {
    host: Option<String>,
    #[serde(default)]
    force: bool,
}

fn resolve_endpoint(state: &AppState, host: &Option<String>) -> Result<HostEndpoint, AppError> {
    match host {
        Some(name) => state
            .hosts
            .get(name)
            .ok_or_else(|| not_found(format!("no host named '{name}'"))),
        None => state
            .hosts
            .active()
            .ok_or_else(|| bad_request("no active host is configured")),
    }
}

async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<HostQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let endpoint = resolve_endpoint(&state, &query.host)?;
    let guard = state.registry.acquire(&endpoint).await?;
    let containers = docker::list_containers(&guard.transport()).await?;
    Ok(Json(serde_json::json!({
        "host": endpoint.name,
        "containers": containers,
    })))
}

async fn container_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
    Query(query): Query<HostQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let action = ContainerAction::parse(&action)
        .ok_or_else(|| bad_request(format!("unknown action '{action}'")))?;
    let endpoint = resolve_endpoint(&state, &query.host)?;
    let guard = state.registry.acquire(&endpoint).await?;
    docker::container_action(&guard.transport(), &id, action).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HostQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let endpoint = resolve_endpoint(&state, &query.host)?;
    let guard = state.registry.acquire(&endpoint).await?;
    docker::remove_container(&guard.transport(), &id, query.force).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ============================================================================
// Session endpoints
// ============================================================================

async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions: Vec<_> = state
        .manager
        .list()
        .into_iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "host": s.host,
                "container": s.container,
                "mode": s.mode,
                "state": format!("{:?}", s.state).to_lowercase(),
            })
        })
        .collect();
    Json(serde_json::json!({ "sessions": sessions }))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.manager.close(&id) {
        return Err(not_found(format!("no session '{id}'")));
    }
    Ok(Json(serde_json::json!({ "closing": id })))
}

// ============================================================================
// The session WebSocket
// ============================================================================

#[derive(Debug, Deserialize)]
struct SessionQuery {
    host: Option<String>,
    container: String,
    /// `exec` (default) or `logs`.
    mode: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
    /// Command line for exec sessions, split on whitespace.
    cmd: Option<String>,
    follow: Option<bool>,
    tail: Option<u32>,
    since: Option<i64>,
    timestamps: Option<bool>,
}

fn build_request(query: &SessionQuery) -> Result<SessionRequest, String> {
    let mode = match query.mode.as_deref() {
        None => SessionMode::Exec,
        Some(s) => SessionMode::parse(s).ok_or_else(|| format!("unknown mode '{s}'"))?,
    };
    let mut request = match mode {
        SessionMode::Exec => SessionRequest::exec(query.host.clone(), query.container.clone()),
        SessionMode::Logs => SessionRequest::logs(query.host.clone(), query.container.clone()),
    };
    if let Some(cmd) = &query.cmd {
        let command: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            return Err("cmd must not be empty".to_string());
        }
        request.command = command;
    }
    request.size = TtySize {
        cols: query.cols.unwrap_or(80),
        rows: query.rows.unwrap_or(24),
    };
    request.logs = LogOptions {
        follow: query.follow.unwrap_or(true),
        tail: query.tail.or(Some(docker::DEFAULT_LOG_TAIL)),
        since: query.since,
        timestamps: query.timestamps.unwrap_or(false),
    };
    Ok(request)
}

async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, query))
}

async fn handle_session_socket(socket: WebSocket, state: AppState, query: SessionQuery) {
    let (ws_sink, ws_stream) = socket.split();
    let mut sink = WsSink { inner: ws_sink };
    let source = WsSource { inner: ws_stream };

    let request = match build_request(&query) {
        Ok(request) => request,
        Err(message) => {
            let _ = sink
                .send_control(&ServerControl::Error(ErrorMessage {
                    code: ErrorCode::InvalidRequest,
                    message,
                    recoverable: false,
                }))
                .await;
            sink.close().await;
            return;
        }
    };

    // Setup failures are reported to the client inside `open`; nothing else
    // to do with them here.
    let _ = state.manager.open(sink, source, request).await;
}

/// [`ClientSink`] over the WebSocket write half.
struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl ClientSink for WsSink {
    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
        self.inner
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
    }

    async fn send_control(&mut self, message: &ServerControl) -> std::io::Result<()> {
        let json = message
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.inner
            .send(Message::Text(json))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
    }
}

/// [`ClientSource`] over the WebSocket read half.
struct WsSource {
    inner: SplitStream<WebSocket>,
}

impl ClientSource for WsSource {
    async fn recv(&mut self) -> Option<ClientFrame> {
        loop {
            let message = match self.inner.next().await {
                Some(Ok(message)) => message,
                // Errored or vanished; either way the client is gone.
                Some(Err(_)) | None => return None,
            };
            match message {
                Message::Binary(data) => return Some(ClientFrame::Data(Bytes::from(data))),
                Message::Text(text) => match ClientControl::from_json(&text) {
                    Ok(control) => return Some(ClientFrame::Control(control)),
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring unparseable control frame");
                    }
                },
                Message::Close(_) => return None,
                // Pings are answered by the axum layer.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }
}
