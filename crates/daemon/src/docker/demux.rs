//! Decoder for the daemon's multiplexed stream framing.
//!
//! When a container runs without a TTY, its log and attach streams interleave
//! stdout and stderr on one connection using 8-byte frame headers:
//!
//! - 1 byte: stream id (0 = stdin, 1 = stdout, 2 = stderr)
//! - 3 bytes: zero padding
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! TTY streams carry no framing and never pass through this decoder.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Frame header size: 1 (stream id) + 3 (padding) + 4 (length) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum accepted payload length for a single frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors from the demultiplexer.
#[derive(Debug, Error)]
pub enum DemuxError {
    /// The stream id byte was not a known stream.
    #[error("unknown stream id: {0}")]
    UnknownStream(u8),

    /// A frame declared a payload larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// The enforced limit.
        max: usize,
    },
}

/// Which standard stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    /// Standard input (only seen on attach streams).
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StdStream {
    fn from_byte(byte: u8) -> Result<Self, DemuxError> {
        match byte {
            0 => Ok(StdStream::Stdin),
            1 => Ok(StdStream::Stdout),
            2 => Ok(StdStream::Stderr),
            other => Err(DemuxError::UnknownStream(other)),
        }
    }
}

/// Incremental decoder for multiplexed stream frames.
///
/// Feed raw connection bytes in with [`feed`], drain decoded frames with
/// [`next_frame`]. Partial frames are buffered until complete.
///
/// [`feed`]: Demuxer::feed
/// [`next_frame`]: Demuxer::next_frame
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: BytesMut,
}

impl Demuxer {
    /// Creates an empty demuxer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the connection.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame, or `None` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<(StdStream, Bytes)>, DemuxError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let stream = StdStream::from_byte(self.buf[0])?;
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DemuxError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_SIZE);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some((stream, payload)))
    }

    /// Bytes buffered but not yet decodable into a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
