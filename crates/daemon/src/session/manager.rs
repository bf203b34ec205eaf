//! Session manager: the tracked set of live sessions.
//!
//! Admission (the configured session limit) is checked before any I/O.
//! Setup runs inline in `open` so failures are returned to the caller and
//! reported to the client; only a session whose stream actually opened
//! enters the tracked set. From there the bridge task owns teardown and
//! removes the entry once both pumps have confirmed termination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use protocol::{CloseReason, Opened, ServerControl, SessionMode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::docker::{self, HostRegistry, LogOptions, StreamHandle, TtySize};
use crate::hosts::{HostEndpoint, HostStore};
use crate::session::bridge::SessionBridge;
use crate::session::channel::{ClientSink, ClientSource};
use crate::session::{SessionError, SessionId, SessionState};

/// Default shell started for exec sessions with no explicit command.
pub const DEFAULT_EXEC_COMMAND: &str = "/bin/sh";

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Target host name. `None` uses the store's active host.
    pub host: Option<String>,
    /// Target container id or name.
    pub container: String,
    /// Exec or logs.
    pub mode: SessionMode,
    /// Command for exec sessions.
    pub command: Vec<String>,
    /// Initial terminal size for exec sessions.
    pub size: TtySize,
    /// Options for log sessions.
    pub logs: LogOptions,
}

impl SessionRequest {
    /// An exec request with the default shell and terminal size.
    pub fn exec(host: Option<String>, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            mode: SessionMode::Exec,
            command: vec![DEFAULT_EXEC_COMMAND.to_string()],
            size: TtySize::default(),
            logs: LogOptions::default(),
        }
    }

    /// A log-follow request with default options.
    pub fn logs(host: Option<String>, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            mode: SessionMode::Logs,
            command: Vec::new(),
            size: TtySize::default(),
            logs: LogOptions::default(),
        }
    }
}

/// Information about a tracked session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Host the session targets.
    pub host: String,
    /// Container the session targets.
    pub container: String,
    /// Exec or logs.
    pub mode: SessionMode,
    /// Current lifecycle state.
    pub state: SessionState,
}

struct SessionEntry {
    host: String,
    container: String,
    mode: SessionMode,
    state: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    external_reason: Arc<OnceLock<CloseReason>>,
    task: Option<JoinHandle<()>>,
}

/// Tracks every live session and enforces the global session limit.
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionEntry>,
    registry: HostRegistry,
    hosts: Arc<HostStore>,
    max_sessions: usize,
    /// Sessions counted from admission through final cleanup, including
    /// opens still in setup.
    live: AtomicUsize,
}

impl SessionManager {
    /// Creates a manager.
    pub fn new(registry: HostRegistry, hosts: Arc<HostStore>, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            hosts,
            max_sessions,
            live: AtomicUsize::new(0),
        }
    }

    /// The registry this manager acquires transports from.
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Opens a session and starts its bridge.
    ///
    /// On failure the client is notified with a structured error, the
    /// channel is closed, and nothing is tracked. On success the returned
    /// id stays in the tracked set until both pump directions have drained
    /// and the transport reference is released.
    pub async fn open<Si, So>(
        self: &Arc<Self>,
        mut sink: Si,
        source: So,
        request: SessionRequest,
    ) -> Result<SessionId, SessionError>
    where
        Si: ClientSink,
        So: ClientSource,
    {
        // Admission first, before any I/O.
        if self.live.fetch_add(1, Ordering::SeqCst) >= self.max_sessions {
            self.live.fetch_sub(1, Ordering::SeqCst);
            let err = SessionError::TooManySessions {
                limit: self.max_sessions,
            };
            let _ = sink
                .send_control(&ServerControl::Error(err.to_error_message()))
                .await;
            sink.close().await;
            return Err(err);
        }

        let (target, handle) = match self.setup(&request).await {
            Ok(opened) => opened,
            Err(err) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(
                    container = %request.container,
                    error = %err,
                    "session setup failed"
                );
                let _ = sink
                    .send_control(&ServerControl::Error(err.to_error_message()))
                    .await;
                sink.close().await;
                return Err(err);
            }
        };
        let (endpoint, guard) = target;

        let id: SessionId = Uuid::new_v4().to_string();
        let state = Arc::new(RwLock::new(SessionState::Starting));
        let cancel = CancellationToken::new();
        let external_reason = Arc::new(OnceLock::new());

        self.sessions.insert(
            id.clone(),
            SessionEntry {
                host: endpoint.name.clone(),
                container: request.container.clone(),
                mode: request.mode,
                state: Arc::clone(&state),
                cancel: cancel.clone(),
                external_reason: Arc::clone(&external_reason),
                task: None,
            },
        );

        // Best-effort: a client that vanished during setup is detected by
        // the pumps immediately after they start.
        let _ = sink
            .send_control(&ServerControl::Opened(Opened {
                session_id: id.clone(),
                mode: request.mode,
            }))
            .await;

        tracing::info!(
            session_id = %id,
            host = %endpoint.name,
            container = %request.container,
            mode = ?request.mode,
            "session opened"
        );

        let bridge = SessionBridge {
            id: id.clone(),
            mode: request.mode,
            cancel,
            state,
            external_reason,
        };
        let (reader, control) = handle.split();
        let manager = Arc::clone(self);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            bridge.run(sink, source, reader, control, guard).await;
            manager.sessions.remove(&task_id);
            manager.live.fetch_sub(1, Ordering::SeqCst);
        });
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.task = Some(task);
        }

        Ok(id)
    }

    /// Resolves the endpoint and opens the stream.
    #[allow(clippy::type_complexity)]
    async fn setup(
        &self,
        request: &SessionRequest,
    ) -> Result<((HostEndpoint, docker::TransportGuard), StreamHandle), SessionError> {
        let endpoint = match &request.host {
            Some(name) => self
                .hosts
                .get(name)
                .ok_or_else(|| SessionError::UnknownHost(name.clone()))?,
            None => self.hosts.active().ok_or(SessionError::NoActiveHost)?,
        };

        let guard = self.registry.acquire(&endpoint).await?;
        let transport = guard.transport();

        let handle = match request.mode {
            SessionMode::Exec => {
                docker::open_exec(&transport, &request.container, &request.command, request.size)
                    .await?
            }
            SessionMode::Logs => {
                docker::open_logs(&transport, &request.container, &request.logs).await?
            }
        };

        Ok(((endpoint, guard), handle))
    }

    /// Initiates teardown of a session from outside the bridge.
    ///
    /// Returns `false` if the session is not tracked.
    pub fn close(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                let _ = entry.external_reason.set(CloseReason::ClientRequest);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every tracked session, for daemon shutdown.
    pub fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            let _ = entry.external_reason.set(CloseReason::Shutdown);
            entry.cancel.cancel();
        }
    }

    /// Number of tracked sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session id is still tracked.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Current state of a session, if tracked.
    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|e| *e.state.read().unwrap())
    }

    /// Snapshot of all tracked sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo {
                id: entry.key().clone(),
                host: entry.host.clone(),
                container: entry.container.clone(),
                mode: entry.mode,
                state: *entry.state.read().unwrap(),
            })
            .collect()
    }

    /// Removes entries whose bridge task died without cleaning up.
    ///
    /// The bridge removes its own entry on every normal path; this is the
    /// backstop behind it. Returns how many entries were reaped.
    pub fn sweep(&self) -> usize {
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            if let Some(task) = &entry.task {
                if task.is_finished() {
                    stale.push(entry.key().clone());
                }
            }
        }
        let mut reaped = 0;
        for id in stale {
            if self.sessions.remove(&id).is_some() {
                self.live.fetch_sub(1, Ordering::SeqCst);
                reaped += 1;
                tracing::warn!(session_id = %id, "reaped session left behind by its bridge");
            }
        }
        reaped
    }

    /// Starts a background task that periodically reaps stale sessions.
    pub fn start_sweep_task(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.sweep();
            }
        });
    }
}
