//! Client side of the container-runtime daemon API.
//!
//! Layered bottom-up:
//!
//! - [`http`]: HTTP/1.1 request/response codec over any byte stream
//! - [`demux`]: stdout/stderr frame demultiplexer for non-TTY streams
//! - [`transport`]: dialing (Unix socket / TCP / TLS) and the reusable
//!   per-endpoint [`transport::Transport`]
//! - [`registry`]: process-wide transport cache with reference counting
//! - [`stream`]: open exec/log streams as read + control halves
//! - [`api`]: the daemon API calls themselves

pub mod api;
pub mod demux;
pub mod http;
pub mod registry;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{
    container_action, list_containers, open_exec, open_logs, remove_container, ApiError,
    ContainerAction, ContainerSummary, LogOptions, TtySize, DEFAULT_LOG_TAIL,
};
pub use registry::{HostRegistry, RegistryConfig, TransportGuard};
pub use stream::{StreamControl, StreamError, StreamHandle, StreamReader};
pub use transport::{ConnectError, Connector, DaemonStream, Transport, TransportError};
