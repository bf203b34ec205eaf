//! Open exec and log streams against a container.
//!
//! A [`StreamHandle`] is the uniform interface the session bridge pumps
//! against, regardless of whether the underlying stream is a hijacked exec
//! connection or a followed log body. It splits into a read half and a
//! control half so the two pump directions can run concurrently, each owning
//! its side exclusively.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use protocol::SessionMode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::docker::demux::{DemuxError, Demuxer, StdStream};
use crate::docker::http::{ChunkedDecoder, HttpError};
use crate::docker::transport::{Transport, TransportError};

/// Errors on an open stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// I/O failure on the stream socket.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the stream's wire format.
    #[error("stream protocol error: {0}")]
    Protocol(String),

    /// The operation is not valid for this stream's mode.
    #[error("{0} is not valid for log streams")]
    InvalidOperation(&'static str),

    /// The stream was already closed.
    #[error("stream is closed")]
    Closed,
}

impl From<HttpError> for StreamError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Io(e) => StreamError::Io(e),
            other => StreamError::Protocol(other.to_string()),
        }
    }
}

impl From<DemuxError> for StreamError {
    fn from(err: DemuxError) -> Self {
        StreamError::Protocol(err.to_string())
    }
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        StreamError::Protocol(err.to_string())
    }
}

/// HTTP-level framing of the stream body.
pub(crate) enum BodyTransfer {
    /// Raw bytes until the peer closes (hijacked exec, TTY logs).
    Raw,
    /// Exactly this many bytes remain.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkedDecoder),
}

/// The read half of a stream: an ordered sequence of byte chunks.
pub struct StreamReader {
    io: Box<dyn AsyncRead + Send + Unpin>,
    /// Carries bytes read past the response head, then acts as read buffer.
    buf: BytesMut,
    transfer: BodyTransfer,
    /// Present when the daemon multiplexes stdout/stderr frames.
    demux: Option<Demuxer>,
    eof: bool,
}

impl StreamReader {
    pub(crate) fn new(
        io: Box<dyn AsyncRead + Send + Unpin>,
        leftover: BytesMut,
        transfer: BodyTransfer,
        multiplexed: bool,
    ) -> Self {
        Self {
            io,
            buf: leftover,
            transfer,
            demux: multiplexed.then(Demuxer::new),
            eof: false,
        }
    }

    /// Reads the next chunk of stream bytes.
    ///
    /// Returns `Ok(None)` on a clean end of stream (remote close, container
    /// exit, end of retained logs). A connection that drops mid-body is a
    /// [`StreamError`], not an end of stream.
    pub async fn read(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            if let Some(demux) = &mut self.demux {
                if let Some((stream, payload)) = demux.next_frame()? {
                    match stream {
                        StdStream::Stdout | StdStream::Stderr => {
                            if payload.is_empty() {
                                continue;
                            }
                            return Ok(Some(payload));
                        }
                        StdStream::Stdin => continue,
                    }
                }
            }

            let Some(data) = self.next_transfer_chunk().await? else {
                // Clean underlying end; a half-decoded frame means the peer
                // died mid-frame.
                if let Some(demux) = &self.demux {
                    if demux.pending() > 0 {
                        return Err(StreamError::Protocol(
                            "stream ended inside a multiplexed frame".to_string(),
                        ));
                    }
                }
                return Ok(None);
            };

            match &mut self.demux {
                Some(demux) => {
                    demux.feed(&data);
                    // Loop back to drain decoded frames.
                }
                None => {
                    if data.is_empty() {
                        continue;
                    }
                    return Ok(Some(data));
                }
            }
        }
    }

    /// Yields the next transfer-decoded span of body bytes.
    async fn next_transfer_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        loop {
            match &mut self.transfer {
                BodyTransfer::Raw => {
                    if !self.buf.is_empty() {
                        return Ok(Some(self.buf.split().freeze()));
                    }
                    if self.eof {
                        return Ok(None);
                    }
                    let n = self.io.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        self.eof = true;
                        return Ok(None);
                    }
                }
                BodyTransfer::Length(remaining) => {
                    if *remaining == 0 {
                        return Ok(None);
                    }
                    if !self.buf.is_empty() {
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        return Ok(Some(self.buf.split_to(take).freeze()));
                    }
                    let n = self.io.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        return Err(StreamError::Protocol(
                            "stream ended before declared body length".to_string(),
                        ));
                    }
                }
                BodyTransfer::Chunked(decoder) => {
                    if let Some(data) = decoder.decode(&mut self.buf)? {
                        return Ok(Some(data));
                    }
                    if decoder.is_done() {
                        return Ok(None);
                    }
                    let n = self.io.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        return Err(StreamError::Protocol(
                            "stream ended inside chunked body".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

/// The control half of a stream: input, resize, exit code, close.
pub struct StreamControl {
    mode: SessionMode,
    writer: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
    exec_id: Option<String>,
    transport: Arc<Transport>,
    closed: bool,
}

impl StreamControl {
    pub(crate) fn new_exec(
        writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
        exec_id: String,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            mode: SessionMode::Exec,
            writer: Some(writer),
            exec_id: Some(exec_id),
            transport,
            closed: false,
        }
    }

    pub(crate) fn new_logs(transport: Arc<Transport>) -> Self {
        Self {
            mode: SessionMode::Logs,
            writer: None,
            exec_id: None,
            transport,
            closed: false,
        }
    }

    /// The mode this stream was opened in.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Forwards input bytes to the exec stream.
    ///
    /// Log streams are read-only; writing to one fails without affecting the
    /// stream.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.mode == SessionMode::Logs {
            return Err(StreamError::InvalidOperation("write"));
        }
        if self.closed {
            return Err(StreamError::Closed);
        }
        let writer = self.writer.as_mut().ok_or(StreamError::Closed)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Applies a terminal size change to the exec stream.
    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), StreamError> {
        if self.mode == SessionMode::Logs {
            return Err(StreamError::InvalidOperation("resize"));
        }
        if self.closed {
            return Err(StreamError::Closed);
        }
        let exec_id = self.exec_id.as_deref().ok_or(StreamError::Closed)?;
        crate::docker::api::exec_resize(&self.transport, exec_id, cols, rows)
            .await
            .map_err(|e| StreamError::Protocol(e.to_string()))
    }

    /// Fetches the exit code of an exec stream's process, once it has ended.
    ///
    /// Returns `None` for log streams, for a process that is still running,
    /// or when the daemon cannot be asked.
    pub async fn exit_code(&self) -> Option<i64> {
        let exec_id = self.exec_id.as_deref()?;
        match crate::docker::api::exec_exit_code(&self.transport, exec_id).await {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(error = %e, "could not inspect exec exit code");
                None
            }
        }
    }

    /// Releases the remote stream. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// One open exec or log stream against one container.
pub struct StreamHandle {
    pub(crate) reader: StreamReader,
    pub(crate) control: StreamControl,
}

impl StreamHandle {
    /// The mode this stream was opened in.
    pub fn mode(&self) -> SessionMode {
        self.control.mode()
    }

    /// Splits the handle into its independently-owned halves.
    pub fn split(self) -> (StreamReader, StreamControl) {
        (self.reader, self.control)
    }
}
