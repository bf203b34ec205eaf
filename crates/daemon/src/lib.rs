//! # Dockbridge Daemon Library
//!
//! This crate provides the daemon functionality for Dockbridge, bridging
//! browser clients onto container-runtime daemons across one or more hosts.
//!
//! ## Overview
//!
//! The daemon serves two surfaces:
//!
//! - **Session channels**: one WebSocket per interactive exec or log-follow
//!   session, pumped bidirectionally onto the target daemon's stream
//! - **Management API**: JSON endpoints for host endpoints, container
//!   listing and lifecycle, and session listing/close
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Server                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────────────────────────────┐    │
//! │  │   Session    │   │            Session Bridges           │    │
//! │  │   Manager    │──▶│  outbound pump ◀── stream reader     │    │
//! │  └──────────────┘   │  inbound pump  ──▶ stream control    │    │
//! │         │           └──────────────────────────────────────┘    │
//! │         ▼                              │                        │
//! │  ┌──────────────┐   ┌──────────────────▼───────────────────┐    │
//! │  │  Host Store  │   │         Host Connection Registry     │    │
//! │  └──────────────┘   │   (refcounted transports per host)   │    │
//! │                     └──────────────────────────────────────┘    │
//! │                                        │                        │
//! │                     unix socket / tcp / tls to each daemon      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`hosts`]: Persistent host endpoint store
//! - [`docker`]: Daemon API client (transports, registry, streams)
//! - [`session`]: Session bridge and manager
//! - [`server`]: HTTP server and WebSocket endpoint

pub mod config;
pub mod docker;
pub mod hosts;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export host types for convenience
pub use hosts::{HostEndpoint, HostStore, TcpTarget, TlsMaterial};

// Re-export docker types for convenience
pub use docker::{
    ApiError, ConnectError, ContainerAction, ContainerSummary, HostRegistry, LogOptions,
    RegistryConfig, StreamError, StreamHandle, Transport, TransportGuard, TtySize,
};

// Re-export session types for convenience
pub use session::{
    ClientFrame, ClientSink, ClientSource, SessionError, SessionId, SessionInfo, SessionManager,
    SessionRequest, SessionState,
};

// Re-export server types for convenience
pub use server::{create_router, serve, AppState};
