//! Session management: one live bridge per client connection.
//!
//! A session binds one client channel to exactly one exec or log stream.
//! The [`bridge`] module runs the per-session pump loops; the [`manager`]
//! tracks the set of active sessions and guarantees cleanup on every
//! termination path.

pub mod bridge;
pub mod channel;
pub mod manager;

use protocol::{ErrorCode, ErrorMessage};
use thiserror::Error;

use crate::docker::{ApiError, ConnectError};

/// Unique identifier for a session.
pub type SessionId = String;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream setup is in progress.
    Starting,
    /// Both pumps are running.
    Active,
    /// Teardown has begun; pumps are draining.
    Closing,
    /// Both pumps have confirmed termination and resources are released.
    Closed,
    /// Stream setup failed; the session never became active.
    Failed,
}

/// Errors opening a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No configured host has the requested name.
    #[error("no host named '{0}' is configured")]
    UnknownHost(String),

    /// No host was named and no active host is configured.
    #[error("no active host is configured")]
    NoActiveHost,

    /// The configured concurrent-session limit was reached.
    #[error("session limit of {limit} reached")]
    TooManySessions {
        /// The configured limit.
        limit: usize,
    },

    /// No transport could be established to the host.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The transport was fine but the stream could not be opened.
    #[error(transparent)]
    Setup(#[from] ApiError),
}

impl SessionError {
    /// The wire error code for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::UnknownHost(_) | SessionError::NoActiveHost => ErrorCode::UnknownHost,
            SessionError::TooManySessions { .. } => ErrorCode::TooManySessions,
            SessionError::Connect(_) => ErrorCode::ConnectFailure,
            SessionError::Setup(ApiError::Connect(_)) => ErrorCode::ConnectFailure,
            SessionError::Setup(_) => ErrorCode::StreamSetupFailure,
        }
    }

    /// The structured error sent to the client before the channel closes.
    pub fn to_error_message(&self) -> ErrorMessage {
        ErrorMessage {
            code: self.error_code(),
            message: self.to_string(),
            recoverable: false,
        }
    }
}

pub use channel::{ClientFrame, ClientSink, ClientSource};
pub use manager::{SessionInfo, SessionManager, SessionRequest};
