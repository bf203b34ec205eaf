//! A scripted in-process container-runtime daemon.
//!
//! Speaks just enough of the daemon HTTP API for the e2e suite: ping, exec
//! create/start/resize/inspect, chunked log streams, and container
//! listing/lifecycle. Containers: `c1` and `c2` exist and run, `stopped`
//! exists but refuses exec, anything else is unknown.
//!
//! The exec stream is a toy shell: `echo X` writes `X` back, `exit` ends
//! the stream. Log streams deliver whatever the test feeds through
//! [`FakeDaemon::feed_log`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

pub struct FakeDaemon {
    pub addr: SocketAddr,
    log_tx: broadcast::Sender<Vec<u8>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

#[derive(Clone)]
struct Shared {
    log_tx: broadcast::Sender<Vec<u8>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl FakeDaemon {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (log_tx, _) = broadcast::channel(64);
        let resizes = Arc::new(Mutex::new(Vec::new()));

        let shared = Shared {
            log_tx: log_tx.clone(),
            resizes: Arc::clone(&resizes),
        };
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(socket, shared).await;
                });
            }
        });

        Self {
            addr,
            log_tx,
            resizes,
        }
    }

    /// Appends a line of container log output.
    pub fn feed_log(&self, line: &[u8]) {
        let _ = self.log_tx.send(line.to_vec());
    }

    /// All terminal sizes applied so far, as (cols, rows).
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

/// One parsed request.
struct Request {
    method: String,
    path: String,
    query: String,
}

/// Reads one request head plus its body from the socket.
///
/// Returns `None` when the peer closes between requests.
async fn read_request(socket: &mut TcpStream, pending: &mut Vec<u8>) -> Option<Request> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            let head: Vec<u8> = pending.drain(..end + 4).collect();
            let head = String::from_utf8_lossy(&head).into_owned();

            let mut lines = head.split("\r\n");
            let request_line = lines.next()?;
            let mut parts = request_line.split(' ');
            let method = parts.next()?.to_string();
            let target = parts.next()?.to_string();
            let (path, query) = match target.split_once('?') {
                Some((p, q)) => (p.to_string(), q.to_string()),
                None => (target, String::new()),
            };

            let content_length = lines
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while pending.len() < content_length {
                let n = socket.read(&mut buf).await.ok()?;
                if n == 0 {
                    return None;
                }
                pending.extend_from_slice(&buf[..n]);
            }
            pending.drain(..content_length);

            return Some(Request {
                method,
                path,
                query,
            });
        }

        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        pending.extend_from_slice(&buf[..n]);
    }
}

async fn respond(
    socket: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(body).await?;
    socket.flush().await
}

async fn respond_not_found(socket: &mut TcpStream, what: &str) -> std::io::Result<()> {
    let body = format!("{{\"message\":\"No such container: {what}\"}}");
    respond(socket, "404 Not Found", "application/json", body.as_bytes()).await
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn container_exists(id: &str) -> bool {
    matches!(id, "c1" | "c2" | "stopped")
}

async fn handle_connection(mut socket: TcpStream, shared: Shared) -> std::io::Result<()> {
    let mut pending = Vec::new();
    while let Some(request) = read_request(&mut socket, &mut pending).await {
        let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["_ping"]) => {
                respond(&mut socket, "200 OK", "text/plain", b"OK").await?;
            }

            ("GET", ["containers", "json"]) => {
                let body = r#"[
                    {"Id":"c1","Names":["/web"],"Image":"nginx:latest","State":"running","Status":"Up 2 hours"},
                    {"Id":"c2","Names":["/db"],"Image":"postgres:16","State":"running","Status":"Up 2 hours"}
                ]"#;
                respond(&mut socket, "200 OK", "application/json", body.as_bytes()).await?;
            }

            ("POST", ["containers", id, "exec"]) => {
                if !container_exists(id) {
                    respond_not_found(&mut socket, id).await?;
                } else if *id == "stopped" {
                    let body = format!("{{\"message\":\"Container {id} is not running\"}}");
                    respond(&mut socket, "409 Conflict", "application/json", body.as_bytes())
                        .await?;
                } else {
                    let body = format!("{{\"Id\":\"exec-{id}\"}}");
                    respond(&mut socket, "201 Created", "application/json", body.as_bytes())
                        .await?;
                }
            }

            ("POST", ["exec", _id, "start"]) => {
                socket
                    .write_all(b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n")
                    .await?;
                socket.flush().await?;
                // The connection now belongs to the exec stream.
                let leftover = std::mem::take(&mut pending);
                return run_exec_shell(socket, leftover).await;
            }

            ("POST", ["exec", _id, "resize"]) => {
                let rows = query_param(&request.query, "h").and_then(|v| v.parse().ok());
                let cols = query_param(&request.query, "w").and_then(|v| v.parse().ok());
                if let (Some(cols), Some(rows)) = (cols, rows) {
                    shared.resizes.lock().unwrap().push((cols, rows));
                }
                respond(&mut socket, "200 OK", "text/plain", b"").await?;
            }

            ("GET", ["exec", _id, "json"]) => {
                respond(
                    &mut socket,
                    "200 OK",
                    "application/json",
                    b"{\"Running\":false,\"ExitCode\":0}",
                )
                .await?;
            }

            ("GET", ["containers", id, "logs"]) => {
                if !container_exists(id) {
                    respond_not_found(&mut socket, id).await?;
                    continue;
                }
                let follow = query_param(&request.query, "follow") == Some("1");
                // The connection now belongs to the log stream.
                return run_logs(socket, shared.log_tx.subscribe(), follow).await;
            }

            ("POST", ["containers", id, "start" | "stop" | "restart"]) => {
                if !container_exists(id) {
                    respond_not_found(&mut socket, id).await?;
                } else {
                    respond(&mut socket, "204 No Content", "text/plain", b"").await?;
                }
            }

            ("DELETE", ["containers", id]) => {
                if !container_exists(id) {
                    respond_not_found(&mut socket, id).await?;
                } else {
                    respond(&mut socket, "204 No Content", "text/plain", b"").await?;
                }
            }

            _ => {
                respond(&mut socket, "400 Bad Request", "text/plain", b"unscripted request")
                    .await?;
            }
        }
    }
    Ok(())
}

/// A toy interactive shell on a hijacked exec connection.
async fn run_exec_shell(mut socket: TcpStream, leftover: Vec<u8>) -> std::io::Result<()> {
    let mut line = leftover;
    let mut buf = [0u8; 1024];
    loop {
        while let Some(pos) = line.iter().position(|&b| b == b'\n') {
            let command: Vec<u8> = line.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&command[..command.len() - 1])
                .trim()
                .to_string();
            if command == "exit" {
                socket.shutdown().await?;
                return Ok(());
            }
            if let Some(rest) = command.strip_prefix("echo ") {
                socket.write_all(format!("{rest}\n").as_bytes()).await?;
                socket.flush().await?;
            }
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return Ok(()),
            Ok(n) => line.extend_from_slice(&buf[..n]),
        }
    }
}

/// Streams fed log lines as a chunked response body.
async fn run_logs(
    mut socket: TcpStream,
    mut feed: broadcast::Receiver<Vec<u8>>,
    follow: bool,
) -> std::io::Result<()> {
    socket
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await?;
    socket.flush().await?;

    if follow {
        loop {
            match feed.recv().await {
                Ok(data) => {
                    let chunk = format!("{:x}\r\n", data.len());
                    socket.write_all(chunk.as_bytes()).await?;
                    socket.write_all(&data).await?;
                    socket.write_all(b"\r\n").await?;
                    socket.flush().await?;
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    socket.write_all(b"0\r\n\r\n").await?;
    socket.flush().await
}
