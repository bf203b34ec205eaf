//! Protocol message definitions for Dockbridge session channels.
//!
//! This module defines the control messages exchanged between the daemon and
//! browser clients over a session WebSocket. Terminal data travels as binary
//! frames and is not wrapped in a message type; everything else (resize,
//! close, session lifecycle, errors) is a JSON-encoded control message in a
//! text frame.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// The kind of stream a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Interactive exec stream with a pseudo-terminal. Bidirectional.
    Exec,
    /// Log-tail stream. Read-only.
    Logs,
}

impl SessionMode {
    /// Parses a mode from its query-string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exec" => Some(SessionMode::Exec),
            "logs" => Some(SessionMode::Logs),
            _ => None,
        }
    }

    /// Returns the query-string form of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Exec => "exec",
            SessionMode::Logs => "logs",
        }
    }
}

/// Control messages sent from the client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientControl {
    /// Terminal size change.
    Resize(Resize),
    /// Voluntary session close.
    Close,
}

/// Control messages sent from the daemon to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerControl {
    /// The session stream is open; data frames follow.
    Opened(Opened),
    /// The remote process exited. Sent for exec sessions before `Closed`.
    Exited(Exited),
    /// An error occurred. Fatal errors are followed by `Closed`.
    Error(ErrorMessage),
    /// The session is over; no more frames will be sent.
    Closed(Closed),
}

/// Terminal dimensions for a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

/// Session-open confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opened {
    /// The daemon-assigned session identifier.
    pub session_id: String,
    /// The mode the session was opened in.
    pub mode: SessionMode,
}

/// Exit notification for an exec session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exited {
    /// Process exit code, when the daemon reported one.
    pub code: Option<i64>,
}

/// Session-close notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closed {
    /// Why the session ended.
    pub reason: CloseReason,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client asked for the session to close.
    ClientRequest,
    /// The remote stream ended normally (container exit, end of logs).
    StreamEnd,
    /// The remote stream failed mid-session.
    StreamError,
    /// The daemon is shutting down.
    Shutdown,
}

/// Error message surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Whether the session survives this error.
    pub recoverable: bool,
}

/// Error codes for session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No transport could be established to the target host.
    ConnectFailure,
    /// The host was reachable but the stream could not be opened.
    StreamSetupFailure,
    /// An already-open stream failed.
    StreamError,
    /// The operation is not valid for this session mode.
    InvalidOperation,
    /// The configured session limit was reached.
    TooManySessions,
    /// No host endpoint with the requested name is configured.
    UnknownHost,
    /// The request was malformed.
    InvalidRequest,
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl ClientControl {
    /// Serialize the message to a JSON string for a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from a text frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerControl {
    /// Serialize the message to a JSON string for a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from a text frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_client(msg: ClientControl) {
        let json = msg.to_json().expect("serialization failed");
        let decoded = ClientControl::from_json(&json).expect("deserialization failed");
        assert_eq!(msg, decoded);
    }

    fn roundtrip_server(msg: ServerControl) {
        let json = msg.to_json().expect("serialization failed");
        let decoded = ServerControl::from_json(&json).expect("deserialization failed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_resize_roundtrip() {
        roundtrip_client(ClientControl::Resize(Resize { cols: 120, rows: 40 }));
    }

    #[test]
    fn test_close_roundtrip() {
        roundtrip_client(ClientControl::Close);
    }

    #[test]
    fn test_opened_roundtrip() {
        roundtrip_server(ServerControl::Opened(Opened {
            session_id: "a1b2c3".to_string(),
            mode: SessionMode::Exec,
        }));
    }

    #[test]
    fn test_exited_roundtrip() {
        roundtrip_server(ServerControl::Exited(Exited { code: Some(137) }));
        roundtrip_server(ServerControl::Exited(Exited { code: None }));
    }

    #[test]
    fn test_error_roundtrip() {
        roundtrip_server(ServerControl::Error(ErrorMessage {
            code: ErrorCode::ConnectFailure,
            message: "connection refused".to_string(),
            recoverable: false,
        }));
    }

    #[test]
    fn test_closed_roundtrip() {
        roundtrip_server(ServerControl::Closed(Closed {
            reason: CloseReason::StreamEnd,
        }));
    }

    /// Browser clients depend on the exact tagged shape, so pin it down.
    #[test]
    fn test_resize_wire_shape() {
        let msg = ClientControl::Resize(Resize { cols: 80, rows: 24 });
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"resize","data":{"cols":80,"rows":24}}"#);
    }

    #[test]
    fn test_close_wire_shape() {
        let json = ClientControl::Close.to_json().unwrap();
        assert_eq!(json, r#"{"type":"close"}"#);
    }

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::TooManySessions).unwrap();
        assert_eq!(json, r#""too_many_sessions""#);
        let json = serde_json::to_string(&ErrorCode::ConnectFailure).unwrap();
        assert_eq!(json, r#""connect_failure""#);
    }

    #[test]
    fn test_close_reason_wire_names() {
        let json = serde_json::to_string(&CloseReason::ClientRequest).unwrap();
        assert_eq!(json, r#""client_request""#);
    }

    #[test]
    fn test_session_mode_parse() {
        assert_eq!(SessionMode::parse("exec"), Some(SessionMode::Exec));
        assert_eq!(SessionMode::parse("logs"), Some(SessionMode::Logs));
        assert_eq!(SessionMode::parse("attach"), None);
    }

    #[test]
    fn test_session_mode_as_str() {
        assert_eq!(SessionMode::Exec.as_str(), "exec");
        assert_eq!(SessionMode::Logs.as_str(), "logs");
    }

    #[test]
    fn test_unknown_control_rejected() {
        let result = ClientControl::from_json(r#"{"type":"detach"}"#);
        assert!(result.is_err());
    }
}
