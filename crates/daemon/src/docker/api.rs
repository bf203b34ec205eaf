//! Exec/attach adapter and container control calls.
//!
//! Streams get a dedicated socket: an exec session hijacks its connection
//! via `Connection: Upgrade`, and a followed log stream occupies its
//! connection until closed. Everything else (create exec, resize, inspect,
//! list, start/stop) is a short request/response call on the transport's
//! pooled control connection.

use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use thiserror::Error;

use crate::docker::http::{
    read_body, read_head, write_request, BodyFraming, HttpError, Request,
};
use crate::docker::stream::{BodyTransfer, StreamControl, StreamHandle, StreamReader};
use crate::docker::transport::{ConnectError, Response, Transport, TransportError};

/// Default number of retained log lines requested for log sessions.
pub const DEFAULT_LOG_TAIL: u32 = 1000;

/// Initial terminal dimensions for an exec stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtySize {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

impl Default for TtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Options for opening a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open and deliver new output as it appears.
    pub follow: bool,
    /// Limit retained output to this many trailing lines. `None` means all.
    pub tail: Option<u32>,
    /// Only output logged at or after this Unix timestamp.
    pub since: Option<i64>,
    /// Prefix each line with its timestamp.
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            tail: Some(DEFAULT_LOG_TAIL),
            since: None,
            timestamps: false,
        }
    }
}

/// Errors opening streams or issuing container calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The named container does not exist on the host.
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// The container exists but is not running.
    #[error("container is not running: {0}")]
    NotRunning(String),

    /// The daemon refused the request.
    #[error("daemon rejected request with status {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Daemon-supplied message, if any.
        message: String,
    },

    /// The daemon answered with something unparseable.
    #[error("unexpected daemon response: {0}")]
    BadResponse(String),

    /// No connection could be opened for the call.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The exchange failed at the HTTP layer.
    #[error(transparent)]
    Http(#[from] HttpError),
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect(e) => ApiError::Connect(e),
            TransportError::Http(e) => ApiError::Http(e),
        }
    }
}

/// Maps a non-success response to the right error for a container call.
fn check_status(response: &Response, container: &str) -> Result<(), ApiError> {
    match response.head.status {
        200..=299 | 304 => Ok(()),
        404 => Err(ApiError::NoSuchContainer(container.to_string())),
        409 => Err(ApiError::NotRunning(container.to_string())),
        status => Err(ApiError::Rejected {
            status,
            message: daemon_message(&response.body),
        }),
    }
}

/// Pulls the `message` field out of a daemon error body, if present.
fn daemon_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct DaemonError {
        message: String,
    }
    match serde_json::from_slice::<DaemonError>(body) {
        Ok(e) => e.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[derive(Deserialize)]
struct ExecCreated {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ExecInspect {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "ExitCode")]
    exit_code: Option<i64>,
}

/// Starts an interactive exec stream with a pseudo-terminal.
///
/// Creates the exec instance over the control connection, then hijacks a
/// dedicated socket for the byte stream and applies the initial terminal
/// size.
pub async fn open_exec(
    transport: &Arc<Transport>,
    container: &str,
    command: &[String],
    size: TtySize,
) -> Result<StreamHandle, ApiError> {
    let create_body = serde_json::json!({
        "AttachStdin": true,
        "AttachStdout": true,
        "AttachStderr": true,
        "Tty": true,
        "Cmd": command,
    });
    let response = transport
        .request(
            Request::new("POST", format!("/containers/{container}/exec"))
                .body("application/json", create_body.to_string().into_bytes()),
        )
        .await?;
    check_status(&response, container)?;
    let exec: ExecCreated = response
        .json()
        .map_err(|e| ApiError::BadResponse(format!("exec create: {e}")))?;

    let mut stream = transport.open_stream().await?;
    let start = Request::new("POST", format!("/exec/{}/start", exec.id))
        .host(transport.host_header())
        .header("Connection", "Upgrade")
        .header("Upgrade", "tcp")
        .body(
            "application/json",
            serde_json::json!({ "Detach": false, "Tty": true })
                .to_string()
                .into_bytes(),
        );
    write_request(&mut stream, &start).await?;

    let mut buf = BytesMut::new();
    let head = read_head(&mut stream, &mut buf).await?;
    match head.status {
        // Hijacked, or streamed on the same connection by older daemons.
        101 | 200 => {}
        404 => {
            return Err(ApiError::NoSuchContainer(container.to_string()));
        }
        409 => {
            return Err(ApiError::NotRunning(container.to_string()));
        }
        status => {
            let body = read_body(&mut stream, &mut buf, head.body_framing()).await?;
            return Err(ApiError::Rejected {
                status,
                message: daemon_message(&body),
            });
        }
    }

    let (read_half, write_half) = tokio::io::split(stream);
    let reader = StreamReader::new(Box::new(read_half), buf, BodyTransfer::Raw, false);
    let control = StreamControl::new_exec(
        Box::new(write_half),
        exec.id.clone(),
        Arc::clone(transport),
    );

    // Size the TTY before the first output renders. Failure is not fatal;
    // the client will resize again on its next window change.
    if let Err(e) = exec_resize(transport, &exec.id, size.cols, size.rows).await {
        tracing::warn!(exec_id = %exec.id, error = %e, "initial TTY resize failed");
    }

    tracing::debug!(
        container = %container,
        exec_id = %exec.id,
        cols = size.cols,
        rows = size.rows,
        "opened exec stream"
    );

    Ok(StreamHandle { reader, control })
}

/// Builds the request target for a log stream.
fn logs_target(container: &str, options: &LogOptions) -> String {
    let mut target = format!("/containers/{container}/logs?stdout=1&stderr=1");
    if options.follow {
        target.push_str("&follow=1");
    }
    match options.tail {
        Some(n) => target.push_str(&format!("&tail={n}")),
        None => target.push_str("&tail=all"),
    }
    if let Some(since) = options.since {
        target.push_str(&format!("&since={since}"));
    }
    if options.timestamps {
        target.push_str("&timestamps=1");
    }
    target
}

/// Starts a log-tail stream.
///
/// The stream occupies a dedicated socket. With `follow` set it stays open
/// and suspends in `read` until new output arrives; otherwise it ends after
/// the retained output.
pub async fn open_logs(
    transport: &Arc<Transport>,
    container: &str,
    options: &LogOptions,
) -> Result<StreamHandle, ApiError> {
    let mut stream = transport.open_stream().await?;
    let request = Request::new("GET", logs_target(container, options))
        .host(transport.host_header());
    write_request(&mut stream, &request).await?;

    let mut buf = BytesMut::new();
    let head = read_head(&mut stream, &mut buf).await?;
    match head.status {
        200 => {}
        404 => {
            return Err(ApiError::NoSuchContainer(container.to_string()));
        }
        status => {
            let body = read_body(&mut stream, &mut buf, head.body_framing()).await?;
            return Err(ApiError::Rejected {
                status,
                message: daemon_message(&body),
            });
        }
    }

    let transfer = match head.body_framing() {
        BodyFraming::Chunked => BodyTransfer::Chunked(crate::docker::http::ChunkedDecoder::new()),
        BodyFraming::Length(n) => BodyTransfer::Length(n),
        _ => BodyTransfer::Raw,
    };
    let multiplexed = head
        .header("Content-Type")
        .is_some_and(|v| v.contains("multiplexed"));

    let (read_half, _write_half) = tokio::io::split(stream);
    let reader = StreamReader::new(Box::new(read_half), buf, transfer, multiplexed);
    let control = StreamControl::new_logs(Arc::clone(transport));

    tracing::debug!(
        container = %container,
        follow = options.follow,
        multiplexed = multiplexed,
        "opened log stream"
    );

    Ok(StreamHandle { reader, control })
}

/// Applies a terminal size change to an exec instance.
pub(crate) async fn exec_resize(
    transport: &Arc<Transport>,
    exec_id: &str,
    cols: u16,
    rows: u16,
) -> Result<(), ApiError> {
    let response = transport
        .request(Request::new(
            "POST",
            format!("/exec/{exec_id}/resize?h={rows}&w={cols}"),
        ))
        .await?;
    check_status(&response, exec_id)
}

/// Inspects an exec instance for its exit code.
///
/// Returns `None` while the process is still running.
pub(crate) async fn exec_exit_code(
    transport: &Arc<Transport>,
    exec_id: &str,
) -> Result<Option<i64>, ApiError> {
    let response = transport
        .request(Request::new("GET", format!("/exec/{exec_id}/json")))
        .await?;
    check_status(&response, exec_id)?;
    let inspect: ExecInspect = response
        .json()
        .map_err(|e| ApiError::BadResponse(format!("exec inspect: {e}")))?;
    if inspect.running {
        Ok(None)
    } else {
        Ok(inspect.exit_code)
    }
}

/// One container as reported by the daemon's list endpoint.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Full container id.
    pub id: String,
    /// Primary name, without the leading slash.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Lifecycle state (`running`, `exited`, ...).
    pub state: String,
    /// Human-readable status line.
    pub status: String,
}

#[derive(Deserialize)]
struct RawContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

impl From<RawContainer> for ContainerSummary {
    fn from(raw: RawContainer) -> Self {
        let name = raw
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| raw.id.chars().take(12).collect());
        Self {
            id: raw.id,
            name,
            image: raw.image,
            state: raw.state,
            status: raw.status,
        }
    }
}

/// Lists all containers on the host, including stopped ones.
pub async fn list_containers(
    transport: &Arc<Transport>,
) -> Result<Vec<ContainerSummary>, ApiError> {
    let response = transport
        .request(Request::new("GET", "/containers/json?all=1"))
        .await?;
    check_status(&response, "<list>")?;
    let raw: Vec<RawContainer> = response
        .json()
        .map_err(|e| ApiError::BadResponse(format!("container list: {e}")))?;
    Ok(raw.into_iter().map(ContainerSummary::from).collect())
}

/// A lifecycle action on a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    /// Start a stopped container.
    Start,
    /// Stop a running container.
    Stop,
    /// Restart a container.
    Restart,
}

impl ContainerAction {
    /// Parses an action from its API path segment.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(ContainerAction::Start),
            "stop" => Some(ContainerAction::Stop),
            "restart" => Some(ContainerAction::Restart),
            _ => None,
        }
    }

    fn path_segment(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
        }
    }
}

/// Issues a lifecycle action against a container.
pub async fn container_action(
    transport: &Arc<Transport>,
    container: &str,
    action: ContainerAction,
) -> Result<(), ApiError> {
    let response = transport
        .request(Request::new(
            "POST",
            format!("/containers/{container}/{}", action.path_segment()),
        ))
        .await?;
    check_status(&response, container)
}

/// Removes a container.
pub async fn remove_container(
    transport: &Arc<Transport>,
    container: &str,
    force: bool,
) -> Result<(), ApiError> {
    let force = if force { 1 } else { 0 };
    let response = transport
        .request(Request::new(
            "DELETE",
            format!("/containers/{container}?force={force}"),
        ))
        .await?;
    check_status(&response, container)
}
