//! Transports to container-runtime daemons.
//!
//! A [`Connector`] dials one endpoint (local Unix socket, plain TCP, or
//! TLS) within a bounded connect timeout. A [`Transport`] is the open,
//! reusable handle the registry hands out: it keeps one pooled keep-alive
//! connection for short request/response calls and opens dedicated sockets
//! for hijacked exec streams and followed log streams, since HTTP/1.1 cannot
//! multiplex those.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::docker::http::{read_body, read_head, write_request, HttpError, Request, ResponseHead};
use crate::hosts::{HostEndpoint, DEFAULT_SOCKET_PATH};

/// Errors establishing a connection to a daemon endpoint.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The target could not be reached (DNS, refused, network unreachable).
    #[error("cannot reach {target}: {source}")]
    Unreachable {
        /// The dialed target.
        target: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TLS setup or handshake failed.
    #[error("TLS failure for {target}: {message}")]
    Tls {
        /// The dialed target.
        target: String,
        /// Failure description.
        message: String,
    },

    /// The connect timeout elapsed before the connection was established.
    #[error("connect to {target} timed out after {timeout_secs}s")]
    Timeout {
        /// The dialed target.
        target: String,
        /// The configured timeout.
        timeout_secs: u64,
    },

    /// The endpoint accepted the connection but failed the health check.
    #[error("daemon at {target} failed health check: {message}")]
    Unhealthy {
        /// The dialed target.
        target: String,
        /// Failure description.
        message: String,
    },

    /// Local socket endpoints are unavailable on this platform.
    #[error("local socket connections are not supported on this platform")]
    LocalUnsupported,
}

/// Errors issuing a request over an established transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open a connection for the request.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The exchange failed at the HTTP layer.
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// One open socket to a daemon.
pub enum DaemonStream {
    /// Plain TCP.
    Tcp(TcpStream),
    /// TLS over TCP.
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
    /// Local Unix socket.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl std::fmt::Debug for DaemonStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonStream::Tcp(_) => f.write_str("DaemonStream::Tcp"),
            DaemonStream::Tls(_) => f.write_str("DaemonStream::Tls"),
            #[cfg(unix)]
            DaemonStream::Unix(_) => f.write_str("DaemonStream::Unix"),
        }
    }
}

impl AsyncRead for DaemonStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DaemonStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            DaemonStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DaemonStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DaemonStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            DaemonStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DaemonStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            DaemonStream::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DaemonStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            DaemonStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            DaemonStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dials one endpoint with a bounded connect timeout.
pub struct Connector {
    endpoint: HostEndpoint,
    tls: Option<tokio_native_tls::TlsConnector>,
    connect_timeout: Duration,
}

impl Connector {
    /// Builds a connector, loading TLS material if the endpoint carries any.
    pub fn new(endpoint: HostEndpoint, connect_timeout: Duration) -> Result<Self, ConnectError> {
        let tls = match &endpoint.tls {
            Some(material) => Some(build_tls(&endpoint, material)?),
            None => None,
        };
        Ok(Self {
            endpoint,
            tls,
            connect_timeout,
        })
    }

    /// The endpoint this connector dials.
    pub fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    /// The dialed target, for diagnostics.
    pub fn target(&self) -> String {
        match &self.endpoint.address {
            Some(addr) => format!("tcp://{}:{}", addr.host, addr.port),
            None => format!("unix://{DEFAULT_SOCKET_PATH}"),
        }
    }

    /// The `Host` header value requests to this endpoint should carry.
    pub fn host_header(&self) -> String {
        match &self.endpoint.address {
            Some(addr) => addr.host.clone(),
            None => "localhost".to_string(),
        }
    }

    /// Opens a new socket to the endpoint.
    pub async fn dial(&self) -> Result<DaemonStream, ConnectError> {
        let target = self.target();
        match tokio::time::timeout(self.connect_timeout, self.dial_inner()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout {
                target,
                timeout_secs: self.connect_timeout.as_secs(),
            }),
        }
    }

    async fn dial_inner(&self) -> Result<DaemonStream, ConnectError> {
        match &self.endpoint.address {
            None => {
                #[cfg(unix)]
                {
                    let stream = UnixStream::connect(DEFAULT_SOCKET_PATH).await.map_err(
                        |source| ConnectError::Unreachable {
                            target: self.target(),
                            source,
                        },
                    )?;
                    Ok(DaemonStream::Unix(stream))
                }
                #[cfg(not(unix))]
                {
                    Err(ConnectError::LocalUnsupported)
                }
            }
            Some(addr) => {
                let tcp = TcpStream::connect((addr.host.as_str(), addr.port))
                    .await
                    .map_err(|source| ConnectError::Unreachable {
                        target: self.target(),
                        source,
                    })?;
                match &self.tls {
                    None => Ok(DaemonStream::Tcp(tcp)),
                    Some(tls) => {
                        let stream = tls.connect(&addr.host, tcp).await.map_err(|e| {
                            ConnectError::Tls {
                                target: self.target(),
                                message: e.to_string(),
                            }
                        })?;
                        Ok(DaemonStream::Tls(Box::new(stream)))
                    }
                }
            }
        }
    }
}

fn build_tls(
    endpoint: &HostEndpoint,
    material: &crate::hosts::TlsMaterial,
) -> Result<tokio_native_tls::TlsConnector, ConnectError> {
    let tls_err = |message: String| ConnectError::Tls {
        target: format!("host '{}'", endpoint.name),
        message,
    };

    let cert = std::fs::read(&material.cert_file)
        .map_err(|e| tls_err(format!("cannot read {}: {e}", material.cert_file.display())))?;
    let key = std::fs::read(&material.key_file)
        .map_err(|e| tls_err(format!("cannot read {}: {e}", material.key_file.display())))?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| tls_err(format!("invalid client identity: {e}")))?;

    let mut builder = native_tls::TlsConnector::builder();
    builder.identity(identity);
    if let Some(ca_file) = &material.ca_file {
        let ca = std::fs::read(ca_file)
            .map_err(|e| tls_err(format!("cannot read {}: {e}", ca_file.display())))?;
        let ca = native_tls::Certificate::from_pem(&ca)
            .map_err(|e| tls_err(format!("invalid CA certificate: {e}")))?;
        builder.add_root_certificate(ca);
    }

    let connector = builder
        .build()
        .map_err(|e| tls_err(format!("TLS setup failed: {e}")))?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}

/// A pooled keep-alive connection for request/response calls.
struct ControlConn {
    stream: DaemonStream,
    buf: BytesMut,
}

/// A buffered HTTP response.
#[derive(Debug)]
pub struct Response {
    /// Parsed status and headers.
    pub head: ResponseHead,
    /// Complete body bytes.
    pub body: Vec<u8>,
}

impl Response {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body as lossy UTF-8, for error reporting.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

/// An open, reusable handle to one daemon endpoint.
///
/// Health-checked at construction; marked invalid by consumers on fatal
/// errors, after which the registry discards it and builds fresh on the next
/// acquire.
pub struct Transport {
    connector: Connector,
    control: tokio::sync::Mutex<Option<ControlConn>>,
    valid: AtomicBool,
}

impl Transport {
    /// Dials and health-checks the endpoint, keeping the connection pooled.
    pub async fn connect(
        endpoint: HostEndpoint,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let connector = Connector::new(endpoint, connect_timeout)?;
        let mut stream = connector.dial().await?;
        let mut buf = BytesMut::new();

        let target = connector.target();
        let ping = Request::new("GET", "/_ping").host(connector.host_header());
        let head = async {
            write_request(&mut stream, &ping).await?;
            let head = read_head(&mut stream, &mut buf).await?;
            read_body(&mut stream, &mut buf, head.body_framing()).await?;
            Ok::<_, HttpError>(head)
        }
        .await
        .map_err(|e| ConnectError::Unhealthy {
            target: target.clone(),
            message: e.to_string(),
        })?;

        if head.status != 200 {
            return Err(ConnectError::Unhealthy {
                target,
                message: format!("ping returned status {}", head.status),
            });
        }

        let control = if head.is_close() {
            None
        } else {
            Some(ControlConn { stream, buf })
        };

        Ok(Self {
            connector,
            control: tokio::sync::Mutex::new(control),
            valid: AtomicBool::new(true),
        })
    }

    /// The endpoint this transport is connected to.
    pub fn endpoint(&self) -> &HostEndpoint {
        &self.connector.endpoint
    }

    /// Whether the transport is still considered usable.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Marks the transport unusable after a fatal error.
    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// The `Host` header value for requests to this endpoint.
    pub fn host_header(&self) -> String {
        self.connector.host_header()
    }

    /// Opens a dedicated socket, for hijacked or followed streams.
    pub async fn open_stream(&self) -> Result<DaemonStream, ConnectError> {
        self.connector.dial().await
    }

    /// Issues a request/response call over the pooled control connection.
    ///
    /// A stale pooled connection (closed by the daemon while idle) is
    /// replaced with a fresh dial exactly once; errors on a fresh connection
    /// propagate.
    pub async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let request = request.host(self.connector.host_header());
        let mut guard = self.control.lock().await;

        if let Some(mut conn) = guard.take() {
            match roundtrip(&mut conn, &request).await {
                Ok(response) => {
                    if !response.head.is_close() {
                        *guard = Some(conn);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!(
                        target = %self.connector.target(),
                        error = %e,
                        "pooled connection failed, redialing"
                    );
                }
            }
        }

        let stream = self.connector.dial().await?;
        let mut conn = ControlConn {
            stream,
            buf: BytesMut::new(),
        };
        let response = roundtrip(&mut conn, &request).await?;
        if !response.head.is_close() {
            *guard = Some(conn);
        }
        Ok(response)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("target", &self.connector.target())
            .field("valid", &self.is_valid())
            .finish()
    }
}

async fn roundtrip(conn: &mut ControlConn, request: &Request) -> Result<Response, HttpError> {
    write_request(&mut conn.stream, request).await?;
    let head = read_head(&mut conn.stream, &mut conn.buf).await?;
    let body = read_body(&mut conn.stream, &mut conn.buf, head.body_framing()).await?;
    Ok(Response { head, body })
}
