//! Minimal HTTP/1.1 client codec for the container-runtime API.
//!
//! The daemon API is plain HTTP/1.1 over a Unix socket, TCP, or TLS. This
//! module implements the small client-side subset the bridge needs:
//!
//! - request serialization (request line, headers, optional body)
//! - response-head parsing (status line + headers)
//! - body framing: `Content-Length`, `Transfer-Encoding: chunked`, and
//!   read-until-close
//! - `101 Switching Protocols` connection hijack, after which the socket is
//!   a raw bidirectional byte stream
//!
//! Parsing is incremental: callers own a [`BytesMut`] read buffer, and any
//! bytes past the response head stay in it for the body reader (or for the
//! hijacked stream) to consume first.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted response-head size.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum accepted size for a fully-buffered response body.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Errors from the HTTP codec.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The response could not be parsed as HTTP/1.1.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The response head exceeded [`MAX_HEAD_SIZE`].
    #[error("response head exceeds {max} bytes")]
    HeadTooLarge {
        /// The enforced limit.
        max: usize,
    },

    /// A buffered response body exceeded [`MAX_BODY_SIZE`].
    #[error("response body exceeds {max} bytes")]
    BodyTooLarge {
        /// The enforced limit.
        max: usize,
    },

    /// The peer closed the connection before a full response arrived.
    #[error("connection closed before a full response arrived")]
    UnexpectedEof,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An outgoing HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct Request {
    method: &'static str,
    target: String,
    host: String,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Request {
    /// Creates a request for the given method and target (path plus query).
    pub fn new(method: &'static str, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            host: "localhost".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Sets the `Host` header value.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Appends a header.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Attaches a body with the given content type.
    pub fn body(mut self, content_type: &'static str, body: Vec<u8>) -> Self {
        self.headers.push(("Content-Type", content_type.to_string()));
        self.body = body;
        self
    }

    /// Serializes the request into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() || self.method != "GET" {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Writes a request to the stream and flushes it.
pub async fn write_request<S>(stream: &mut S, request: &Request) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&request.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// A parsed response head: status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows (204/304, or a 101 upgrade).
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes the connection.
    UntilClose,
}

impl ResponseHead {
    /// Looks up a header value, case-insensitively. First match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this response hijacks the connection.
    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }

    /// Whether the server will close the connection after this response.
    pub fn is_close(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Determines how the body that follows this head is framed.
    pub fn body_framing(&self) -> BodyFraming {
        if self.status == 101 || self.status == 204 || self.status == 304 {
            return BodyFraming::None;
        }
        if self
            .header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return BodyFraming::Chunked;
        }
        if let Some(len) = self.header("Content-Length") {
            if let Ok(len) = len.trim().parse::<u64>() {
                return BodyFraming::Length(len);
            }
        }
        BodyFraming::UntilClose
    }

    fn parse(head: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HttpError::Malformed("head is not valid UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| HttpError::Malformed("empty head".to_string()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| HttpError::Malformed("missing HTTP version".to_string()))?;
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::Malformed(format!(
                "unsupported HTTP version: {version}"
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| HttpError::Malformed("missing status code".to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Malformed(format!("bad header line: {line}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { status, headers })
    }
}

/// Reads a full response head from the stream.
///
/// Bytes beyond the head remain in `buf` for the body reader to consume.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<ResponseHead, HttpError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            let head = buf.split_to(end + 4);
            return ResponseHead::parse(&head);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge { max: MAX_HEAD_SIZE });
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reads a complete response body into memory according to its framing.
///
/// For [`BodyFraming::Chunked`] the trailing chunk terminator and trailers
/// are consumed so the connection can be reused.
pub async fn read_body<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    framing: BodyFraming,
) -> Result<Vec<u8>, HttpError>
where
    S: AsyncRead + Unpin,
{
    match framing {
        BodyFraming::None => Ok(Vec::new()),
        BodyFraming::Length(len) => {
            if len as usize > MAX_BODY_SIZE {
                return Err(HttpError::BodyTooLarge { max: MAX_BODY_SIZE });
            }
            while buf.len() < len as usize {
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(HttpError::UnexpectedEof);
                }
            }
            Ok(buf.split_to(len as usize).to_vec())
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut body = Vec::new();
            loop {
                while let Some(data) = decoder.decode(buf)? {
                    body.extend_from_slice(&data);
                    if body.len() > MAX_BODY_SIZE {
                        return Err(HttpError::BodyTooLarge { max: MAX_BODY_SIZE });
                    }
                }
                if decoder.is_done() {
                    return Ok(body);
                }
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(HttpError::UnexpectedEof);
                }
            }
        }
        BodyFraming::UntilClose => {
            let mut body = buf.split().to_vec();
            loop {
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Ok(body);
                }
                body.extend_from_slice(&buf.split()[..]);
                if body.len() > MAX_BODY_SIZE {
                    return Err(HttpError::BodyTooLarge { max: MAX_BODY_SIZE });
                }
            }
        }
    }
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// Data is surfaced as soon as it is available inside a chunk rather than
/// once per complete chunk, which matters for followed log streams.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    /// Expecting a chunk-size line.
    Size,
    /// Inside chunk data with this many bytes left.
    Data { remaining: u64 },
    /// Expecting the CRLF that terminates chunk data.
    DataEnd,
    /// Consuming trailer lines after the zero-size chunk.
    Trailer,
    /// Body complete.
    Done,
}

impl ChunkedDecoder {
    /// Creates a decoder positioned before the first chunk.
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Whether the final chunk and trailers have been consumed.
    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Decodes as much as possible from `buf`.
    ///
    /// Returns `Ok(Some(data))` when body bytes are available, `Ok(None)`
    /// when more input is needed or the body is done (check [`is_done`]).
    ///
    /// [`is_done`]: ChunkedDecoder::is_done
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, HttpError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(buf) else {
                        return Ok(None);
                    };
                    let size_text = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_text, 16).map_err(|_| {
                        HttpError::Malformed(format!("bad chunk size: {size_text}"))
                    })?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (remaining.min(buf.len() as u64)) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining: left }
                    };
                    return Ok(Some(data));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(HttpError::Malformed(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line) = take_line(buf) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Takes one CRLF-terminated line out of `buf`, without the terminator.
fn take_line(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = buf.split_to(pos);
    buf.advance(2);
    Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encode_get() {
        let req = Request::new("GET", "/_ping");
        let text = String::from_utf8(req.encode()).unwrap();
        assert!(text.starts_with("GET /_ping HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_request_encode_post_with_body() {
        let req = Request::new("POST", "/containers/abc/exec")
            .host("10.0.0.5")
            .body("application/json", b"{\"Tty\":true}".to_vec());
        let text = String::from_utf8(req.encode()).unwrap();
        assert!(text.starts_with("POST /containers/abc/exec HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.5\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"Tty\":true}"));
    }

    #[test]
    fn test_request_encode_empty_post_has_length() {
        let req = Request::new("POST", "/containers/abc/start");
        let text = String::from_utf8(req.encode()).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_parse_head_basic() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\n";
        let parsed = ResponseHead::parse(head).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.header("content-type"), Some("text/plain"));
        assert_eq!(parsed.body_framing(), BodyFraming::Length(2));
    }

    #[test]
    fn test_parse_head_upgrade() {
        let head = b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n";
        let parsed = ResponseHead::parse(head).unwrap();
        assert!(parsed.is_upgrade());
        assert_eq!(parsed.body_framing(), BodyFraming::None);
    }

    #[test]
    fn test_parse_head_chunked() {
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let parsed = ResponseHead::parse(head).unwrap();
        assert_eq!(parsed.body_framing(), BodyFraming::Chunked);
    }

    #[test]
    fn test_parse_head_until_close() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\n";
        let parsed = ResponseHead::parse(head).unwrap();
        assert_eq!(parsed.body_framing(), BodyFraming::UntilClose);
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(ResponseHead::parse(b"not http at all\r\n\r\n").is_err());
        assert!(ResponseHead::parse(b"HTTP/1.1 banana\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_head_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
            // Dribble the response a few bytes at a time.
            for piece in response.chunks(7) {
                server.write_all(piece).await.unwrap();
                server.flush().await.unwrap();
            }
            server
        });

        let mut buf = BytesMut::new();
        let head = read_head(&mut client, &mut buf).await.unwrap();
        assert_eq!(head.status, 200);
        let body = read_body(&mut client, &mut buf, head.body_framing())
            .await
            .unwrap();
        assert_eq!(body, b"hello");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let (mut client, server) = tokio::io::duplex(16);
        drop(server);
        let mut buf = BytesMut::new();
        let result = read_head(&mut client, &mut buf).await;
        assert!(matches!(result, Err(HttpError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_read_body_until_close() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"streamed output").await.unwrap();
        });
        let mut buf = BytesMut::new();
        let body = read_body(&mut client, &mut buf, BodyFraming::UntilClose)
            .await
            .unwrap();
        assert_eq!(body, b"streamed output");
    }

    #[test]
    fn test_chunked_decoder_single_chunk() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n0\r\n\r\n"[..]);
        let data = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_decoder_incremental() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::new();

        // Size line split across feeds.
        buf.extend_from_slice(b"a");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n");
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        // Partial chunk data is surfaced immediately.
        buf.extend_from_slice(b"01234");
        let data = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&data[..], b"01234");
        assert!(!decoder.is_done());

        buf.extend_from_slice(b"56789\r\n0\r\n\r\n");
        let data = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&data[..], b"56789");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_decoder_multiple_chunks() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n"[..]);
        let mut collected = Vec::new();
        while let Some(data) = decoder.decode(&mut buf).unwrap() {
            collected.extend_from_slice(&data);
        }
        assert_eq!(collected, b"foobar");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunked_decoder_extension_ignored() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"4;name=value\r\ndata\r\n0\r\n\r\n"[..]);
        let data = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&data[..], b"data");
    }

    #[test]
    fn test_chunked_decoder_bad_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_chunked_decoder_missing_crlf() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"3\r\nfooXX"[..]);
        let _ = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(decoder.decode(&mut buf).is_err());
    }
}
