//! # Dockbridge Protocol Library
//!
//! This crate defines the wire protocol spoken between the Dockbridge daemon
//! and browser clients over per-session WebSocket channels.
//!
//! ## Framing
//!
//! A session channel carries two kinds of frames:
//!
//! - **Binary frames**: raw terminal bytes, in both directions. Output from
//!   the container stream is forwarded as-is; input bytes from the client are
//!   forwarded to the exec stream as-is.
//! - **Text frames**: JSON-encoded control messages, [`messages::ClientControl`]
//!   for resize and voluntary close and [`messages::ServerControl`] for
//!   session lifecycle and errors.
//!
//! Keeping data out of the JSON layer means no base64 overhead and no
//! re-framing of the byte stream; ordering within each direction is the
//! WebSocket's ordering.
//!
//! ## Modules
//!
//! - [`messages`]: Control message definitions and error codes
//! - [`error`]: Wire-level error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientControl, CloseReason, Closed, ErrorCode, ErrorMessage, Exited, Opened, Resize,
    ServerControl, SessionMode, PROTOCOL_VERSION,
};
