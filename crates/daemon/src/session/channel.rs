//! Client connection abstraction for session channels.
//!
//! The bridge pumps against these traits rather than a WebSocket directly,
//! so cancellation and backpressure are testable without a browser on the
//! other end. A channel splits into a sink and a source, each owned by
//! exactly one pump; all writes to the client go through the single sink
//! owner, so concurrent sends cannot interleave.

use std::future::Future;

use bytes::Bytes;
use protocol::{ClientControl, ServerControl};

/// One frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Terminal input bytes.
    Data(Bytes),
    /// A parsed control message.
    Control(ClientControl),
}

/// The write half of a client channel.
///
/// Futures are `Send`-bounded because each pump runs as a spawned task.
pub trait ClientSink: Send + 'static {
    /// Sends terminal output bytes to the client.
    ///
    /// Suspends while the client's connection cannot accept more data; this
    /// is the outbound pump's backpressure point. An error means the client
    /// is gone.
    fn send_data(&mut self, data: Bytes) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Sends a control message to the client.
    fn send_control(
        &mut self,
        message: &ServerControl,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Closes the connection to the client. Best-effort.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// The read half of a client channel.
pub trait ClientSource: Send + 'static {
    /// Receives the next frame from the client.
    ///
    /// Returns `None` once the client connection is gone, whether it closed
    /// cleanly or vanished at the transport level. Unparseable frames are
    /// the implementation's concern (typically logged and skipped).
    fn recv(&mut self) -> impl Future<Output = Option<ClientFrame>> + Send;
}

/// In-memory channel implementation.
///
/// Used by the test suites to drive sessions without a WebSocket; the
/// bounded sink capacity makes client backpressure observable.
pub mod memory {
    use super::{ClientFrame, ClientSink, ClientSource};
    use bytes::Bytes;
    use protocol::{ClientControl, ServerControl};
    use tokio::sync::mpsc;

    /// What the remote (test) side observes from the session.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ServerEvent {
        /// Terminal output bytes.
        Data(Bytes),
        /// A control message.
        Control(ServerControl),
    }

    /// Creates a connected channel pair.
    ///
    /// `capacity` bounds the server-to-client direction; a full buffer
    /// suspends the session's outbound pump like a slow client would.
    pub fn channel(capacity: usize) -> (MemorySink, MemorySource, MemoryRemote) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (frame_tx, frame_rx) = mpsc::channel(32);
        (
            MemorySink { tx: event_tx },
            MemorySource { rx: frame_rx },
            MemoryRemote {
                tx: Some(frame_tx),
                rx: event_rx,
            },
        )
    }

    /// Bridge-side sink writing into the remote's event queue.
    pub struct MemorySink {
        tx: mpsc::Sender<ServerEvent>,
    }

    impl ClientSink for MemorySink {
        async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
            self.tx
                .send(ServerEvent::Data(data))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client gone"))
        }

        async fn send_control(&mut self, message: &ServerControl) -> std::io::Result<()> {
            self.tx
                .send(ServerEvent::Control(message.clone()))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client gone"))
        }

        async fn close(&mut self) {}
    }

    /// Bridge-side source reading the remote's frames.
    pub struct MemorySource {
        rx: mpsc::Receiver<ClientFrame>,
    }

    impl ClientSource for MemorySource {
        async fn recv(&mut self) -> Option<ClientFrame> {
            self.rx.recv().await
        }
    }

    /// The test's end of the channel.
    pub struct MemoryRemote {
        tx: Option<mpsc::Sender<ClientFrame>>,
        rx: mpsc::Receiver<ServerEvent>,
    }

    impl MemoryRemote {
        /// Sends terminal input to the session.
        pub async fn send_data(&self, data: &[u8]) -> bool {
            match &self.tx {
                Some(tx) => tx
                    .send(ClientFrame::Data(Bytes::copy_from_slice(data)))
                    .await
                    .is_ok(),
                None => false,
            }
        }

        /// Sends a control message to the session.
        pub async fn send_control(&self, message: ClientControl) -> bool {
            match &self.tx {
                Some(tx) => tx.send(ClientFrame::Control(message)).await.is_ok(),
                None => false,
            }
        }

        /// Receives the next event from the session, or `None` when the
        /// session has released its sink.
        pub async fn next_event(&mut self) -> Option<ServerEvent> {
            self.rx.recv().await
        }

        /// Stops sending frames, as a client that half-closed would.
        pub fn stop_sending(&mut self) {
            self.tx = None;
        }
    }
}
