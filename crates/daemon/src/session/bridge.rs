//! The per-session bridge: two pump loops and a teardown path.
//!
//! A bridge owns one client channel and one stream handle. Once running it
//! is `active`, with two concurrently spawned pumps:
//!
//! - **outbound**: stream reader to client sink. Forwards each chunk as soon
//!   as it is read; suspends on the sink when the client is slow, which in
//!   turn stops stream reads (no unbounded buffering).
//! - **inbound**: client source to stream control. Forwards input bytes and
//!   applies resize events; only exec streams accept input.
//!
//! Either pump ending cancels the shared token, which the other pump's
//! `select!` observes immediately; no teardown path waits on a timeout. Once
//! both pumps have confirmed termination the bridge closes the stream,
//! reports the outcome to the client, releases the transport guard, and only
//! then is the session removed from the manager's tracked set.

use std::sync::{Arc, OnceLock, RwLock};

use protocol::{
    ClientControl, CloseReason, Closed, ErrorCode, ErrorMessage, Exited, ServerControl,
    SessionMode,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::docker::{StreamControl, StreamError, StreamReader, TransportGuard};
use crate::session::channel::{ClientFrame, ClientSink, ClientSource};
use crate::session::{SessionId, SessionState};

/// Why a pump loop ended.
#[derive(Debug)]
enum PumpEnd {
    /// The remote stream ended normally.
    StreamEnd,
    /// The remote stream failed.
    StreamFailed(StreamError),
    /// The client sent a voluntary close.
    ClientClose,
    /// The client connection vanished.
    ClientGone,
    /// Stopped by the other pump or an external close.
    Cancelled,
}

/// One session's bridge.
pub(crate) struct SessionBridge {
    pub id: SessionId,
    pub mode: SessionMode,
    pub cancel: CancellationToken,
    pub state: Arc<RwLock<SessionState>>,
    /// Close reason supplied by an external `close` call, if any.
    pub external_reason: Arc<OnceLock<CloseReason>>,
}

impl SessionBridge {
    /// Runs the session to completion.
    ///
    /// Consumes the stream halves, the client channel, and the transport
    /// guard; all are released by the time this returns, on every path.
    pub(crate) async fn run<Si, So>(
        self,
        sink: Si,
        source: So,
        reader: StreamReader,
        control: StreamControl,
        transport: TransportGuard,
    ) where
        Si: ClientSink,
        So: ClientSource,
    {
        *self.state.write().unwrap() = SessionState::Active;
        tracing::debug!(session_id = %self.id, mode = ?self.mode, "session active");

        // Non-fatal notices (e.g. InvalidOperation) cross from the inbound
        // pump to the sink's single owner instead of writing concurrently.
        let (notice_tx, notice_rx) = mpsc::channel::<ErrorMessage>(8);

        let outbound = tokio::spawn(outbound_pump(
            self.id.clone(),
            reader,
            sink,
            notice_rx,
            self.cancel.clone(),
        ));
        let inbound = tokio::spawn(inbound_pump(
            self.id.clone(),
            source,
            control,
            notice_tx,
            self.cancel.clone(),
        ));

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        *self.state.write().unwrap() = SessionState::Closing;

        let (sink, outbound_end) = match outbound {
            Ok((sink, end)) => (Some(sink), end),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "outbound pump panicked");
                (None, PumpEnd::Cancelled)
            }
        };
        let (control, inbound_end) = match inbound {
            Ok((control, end)) => (Some(control), end),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "inbound pump panicked");
                (None, PumpEnd::Cancelled)
            }
        };

        // Whichever pump ended first carries the cause; the other reports
        // Cancelled because it was stopped via the token.
        let cause = match outbound_end {
            PumpEnd::Cancelled => inbound_end,
            end => end,
        };

        let mut control = control;
        if let Some(control) = control.as_mut() {
            control.close().await;
        }

        if let Some(mut sink) = sink {
            self.report(&mut sink, control.as_ref(), &cause).await;
            sink.close().await;
        }

        drop(transport);
        *self.state.write().unwrap() = SessionState::Closed;
        tracing::info!(session_id = %self.id, cause = ?cause, "session closed");
    }

    /// Sends the final control frames for the session's outcome.
    ///
    /// A vanished client gets nothing; there is nobody to report to.
    async fn report<Si: ClientSink>(
        &self,
        sink: &mut Si,
        control: Option<&StreamControl>,
        cause: &PumpEnd,
    ) {
        let reason = match cause {
            PumpEnd::ClientGone => return,
            PumpEnd::ClientClose => CloseReason::ClientRequest,
            PumpEnd::StreamEnd => {
                if self.mode == SessionMode::Exec {
                    if let Some(control) = control {
                        let code = control.exit_code().await;
                        let _ = sink
                            .send_control(&ServerControl::Exited(Exited { code }))
                            .await;
                    }
                }
                CloseReason::StreamEnd
            }
            PumpEnd::StreamFailed(e) => {
                let _ = sink
                    .send_control(&ServerControl::Error(ErrorMessage {
                        code: ErrorCode::StreamError,
                        message: e.to_string(),
                        recoverable: false,
                    }))
                    .await;
                CloseReason::StreamError
            }
            PumpEnd::Cancelled => self
                .external_reason
                .get()
                .copied()
                .unwrap_or(CloseReason::Shutdown),
        };
        let _ = sink
            .send_control(&ServerControl::Closed(Closed { reason }))
            .await;
    }
}

/// Stream reader to client sink.
async fn outbound_pump<Si: ClientSink>(
    id: SessionId,
    mut reader: StreamReader,
    mut sink: Si,
    mut notices: mpsc::Receiver<ErrorMessage>,
    cancel: CancellationToken,
) -> (Si, PumpEnd) {
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            Some(notice) = notices.recv() => {
                if sink
                    .send_control(&ServerControl::Error(notice))
                    .await
                    .is_err()
                {
                    break PumpEnd::ClientGone;
                }
            }
            chunk = reader.read() => match chunk {
                Ok(Some(data)) => {
                    // This send is the backpressure point: while the client
                    // cannot take more, no further stream reads happen.
                    if sink.send_data(data).await.is_err() {
                        break PumpEnd::ClientGone;
                    }
                }
                Ok(None) => break PumpEnd::StreamEnd,
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "outbound stream error");
                    break PumpEnd::StreamFailed(e);
                }
            }
        }
    };
    cancel.cancel();
    (sink, end)
}

/// Client source to stream control.
async fn inbound_pump<So: ClientSource>(
    id: SessionId,
    mut source: So,
    mut control: StreamControl,
    notices: mpsc::Sender<ErrorMessage>,
    cancel: CancellationToken,
) -> (StreamControl, PumpEnd) {
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            frame = source.recv() => match frame {
                None => break PumpEnd::ClientGone,
                Some(ClientFrame::Data(data)) => match control.write(&data).await {
                    Ok(()) => {}
                    Err(StreamError::InvalidOperation(op)) => {
                        // Caller misuse; the stream is unaffected. Notices
                        // are advisory, so never block on a full queue.
                        let _ = notices.try_send(ErrorMessage {
                            code: ErrorCode::InvalidOperation,
                            message: format!("{op} is not valid for log sessions"),
                            recoverable: true,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %id, error = %e, "inbound write error");
                        break PumpEnd::StreamFailed(e);
                    }
                },
                Some(ClientFrame::Control(ClientControl::Resize(resize))) => {
                    match control.resize(resize.cols, resize.rows).await {
                        Ok(()) => {}
                        Err(StreamError::InvalidOperation(op)) => {
                            let _ = notices.try_send(ErrorMessage {
                                code: ErrorCode::InvalidOperation,
                                message: format!("{op} is not valid for log sessions"),
                                recoverable: true,
                            });
                        }
                        // Control-plane only; data flow decides the
                        // session's fate.
                        Err(e) => {
                            tracing::warn!(session_id = %id, error = %e, "resize failed");
                        }
                    }
                }
                Some(ClientFrame::Control(ClientControl::Close)) => break PumpEnd::ClientClose,
            }
        }
    };
    cancel.cancel();
    (control, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::stream::{BodyTransfer, StreamControl, StreamReader};
    use crate::docker::testutil::{endpoint_for, spawn_ping_server};
    use crate::docker::Transport;
    use crate::session::channel::memory::{channel, ServerEvent};
    use bytes::BytesMut;
    use protocol::Resize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    struct TestSession {
        bridge: SessionBridge,
        reader: StreamReader,
        control: StreamControl,
        guard: crate::docker::TransportGuard,
        registry: crate::docker::HostRegistry,
        /// The fake daemon's end of the stream socket.
        daemon: DuplexStream,
    }

    /// Builds a bridge wired to an in-memory stream and a real (ping-only)
    /// transport acquired through a registry, so teardown effects on the
    /// refcount are observable.
    async fn test_session(mode: SessionMode) -> TestSession {
        let addr = spawn_ping_server().await;
        let endpoint = endpoint_for(addr);
        let registry =
            crate::docker::HostRegistry::new(crate::docker::RegistryConfig {
                connect_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(60),
            });
        let guard = registry.acquire(&endpoint).await.unwrap();
        let transport = guard.transport();

        let (bridge_side, daemon) = tokio::io::duplex(256);
        let (read_half, write_half) = tokio::io::split(bridge_side);
        let reader = StreamReader::new(
            Box::new(read_half),
            BytesMut::new(),
            BodyTransfer::Raw,
            false,
        );
        let control = match mode {
            SessionMode::Exec => StreamControl::new_exec(
                Box::new(write_half),
                "exec-test".to_string(),
                transport,
            ),
            SessionMode::Logs => StreamControl::new_logs(transport),
        };

        let bridge = SessionBridge {
            id: "session-test".to_string(),
            mode,
            cancel: CancellationToken::new(),
            state: Arc::new(RwLock::new(SessionState::Starting)),
            external_reason: Arc::new(OnceLock::new()),
        };

        TestSession {
            bridge,
            reader,
            control,
            guard,
            registry,
            daemon,
        }
    }

    #[tokio::test]
    async fn test_output_forwarded_in_order() {
        let mut session = test_session(SessionMode::Exec).await;
        let (sink, source, mut remote) = channel(32);
        let state = Arc::clone(&session.bridge.state);

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        for i in 0..10 {
            session
                .daemon
                .write_all(format!("chunk-{i};").as_bytes())
                .await
                .unwrap();
        }
        drop(session.daemon);

        let mut received = Vec::new();
        while let Some(event) = remote.next_event().await {
            match event {
                ServerEvent::Data(data) => received.extend_from_slice(&data),
                ServerEvent::Control(_) => {}
            }
        }
        let text = String::from_utf8(received).unwrap();
        let expected: String = (0..10).map(|i| format!("chunk-{i};")).collect();
        assert_eq!(text, expected);

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(*state.read().unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_input_forwarded_in_order() {
        let mut session = test_session(SessionMode::Exec).await;
        let (sink, source, remote) = channel(32);

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        for i in 0..10 {
            assert!(remote.send_data(format!("in-{i};").as_bytes()).await);
        }

        let mut collected = vec![0u8; "in-0;".len() * 10];
        session.daemon.read_exact(&mut collected).await.unwrap();
        let expected: String = (0..10).map(|i| format!("in-{i};")).collect();
        assert_eq!(String::from_utf8(collected).unwrap(), expected);

        drop(remote);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stream_end_reports_exit_and_close() {
        let mut session = test_session(SessionMode::Exec).await;
        let (sink, source, mut remote) = channel(32);

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        session.daemon.write_all(b"bye").await.unwrap();
        drop(session.daemon);

        let mut saw_exited = false;
        let mut close_reason = None;
        while let Some(event) = remote.next_event().await {
            match event {
                ServerEvent::Control(ServerControl::Exited(_)) => saw_exited = true,
                ServerEvent::Control(ServerControl::Closed(closed)) => {
                    close_reason = Some(closed.reason);
                }
                _ => {}
            }
        }
        // The ping-only fake daemon cannot answer the exec inspect, so the
        // exit frame carries no code, but it must still precede the close.
        assert!(saw_exited);
        assert_eq!(close_reason, Some(CloseReason::StreamEnd));

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_close_tears_down() {
        let session = test_session(SessionMode::Exec).await;
        let (sink, source, mut remote) = channel(32);
        let registry = session.registry.clone();

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        assert!(remote.send_control(ClientControl::Close).await);

        let mut close_reason = None;
        while let Some(event) = remote.next_event().await {
            if let ServerEvent::Control(ServerControl::Closed(closed)) = event {
                close_reason = Some(closed.reason);
            }
        }
        assert_eq!(close_reason, Some(CloseReason::ClientRequest));

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(registry.refcount("test"), Some(0));
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_transport() {
        let session = test_session(SessionMode::Exec).await;
        let (sink, source, remote) = channel(32);
        let registry = session.registry.clone();
        assert_eq!(registry.refcount("test"), Some(1));

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        // Abrupt disconnect: both directions vanish at once.
        drop(remote);

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(registry.refcount("test"), Some(0));
    }

    #[tokio::test]
    async fn test_external_cancel_stops_blocked_pumps() {
        let session = test_session(SessionMode::Exec).await;
        let (sink, source, mut remote) = channel(32);
        let cancel = session.bridge.cancel.clone();
        session
            .bridge
            .external_reason
            .set(CloseReason::ClientRequest)
            .unwrap();

        // Neither the daemon nor the client ever sends anything; both pumps
        // sit blocked on reads until the token fires.
        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let mut close_reason = None;
        while let Some(event) = remote.next_event().await {
            if let ServerEvent::Control(ServerControl::Closed(closed)) = event {
                close_reason = Some(closed.reason);
            }
        }
        assert_eq!(close_reason, Some(CloseReason::ClientRequest));
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_log_session_write_is_invalid_operation() {
        let mut session = test_session(SessionMode::Logs).await;
        let (sink, source, mut remote) = channel(32);

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        assert!(remote.send_data(b"cannot type into logs").await);

        let event = timeout(Duration::from_secs(2), remote.next_event())
            .await
            .unwrap()
            .unwrap();
        match event {
            ServerEvent::Control(ServerControl::Error(err)) => {
                assert_eq!(err.code, ErrorCode::InvalidOperation);
                assert!(err.recoverable);
            }
            other => panic!("expected InvalidOperation error, got {other:?}"),
        }

        // The stream itself is unaffected: log data still flows afterwards.
        session.daemon.write_all(b"log line\n").await.unwrap();
        let event = timeout(Duration::from_secs(2), remote.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ServerEvent::Data(bytes::Bytes::from_static(b"log line\n")));

        drop(session.daemon);
        drop(remote);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resize_interleaves_without_corrupting_data() {
        let mut session = test_session(SessionMode::Exec).await;
        let (sink, source, mut remote) = channel(64);

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        // Interleave data and resize control frames from the client while
        // the daemon is also emitting output.
        for i in 0..5 {
            assert!(remote.send_data(format!("key{i}").as_bytes()).await);
            assert!(
                remote
                    .send_control(ClientControl::Resize(Resize {
                        cols: 80 + i,
                        rows: 24,
                    }))
                    .await
            );
            session
                .daemon
                .write_all(format!("out{i}").as_bytes())
                .await
                .unwrap();
        }

        // All input bytes arrive at the daemon, in order, nothing dropped.
        let mut input = vec![0u8; 4 * 5];
        session.daemon.read_exact(&mut input).await.unwrap();
        assert_eq!(
            String::from_utf8(input).unwrap(),
            "key0key1key2key3key4"
        );

        // All output bytes reach the client, in order.
        let mut output = String::new();
        while output.len() < 4 * 5 {
            match timeout(Duration::from_secs(2), remote.next_event())
                .await
                .unwrap()
                .unwrap()
            {
                ServerEvent::Data(data) => {
                    output.push_str(std::str::from_utf8(&data).unwrap())
                }
                ServerEvent::Control(_) => {}
            }
        }
        assert_eq!(output, "out0out1out2out3out4");

        drop(session.daemon);
        drop(remote);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_suspends_stream_reads() {
        let mut session = test_session(SessionMode::Exec).await;
        // Sink capacity of one: the outbound pump can park at most one
        // unconsumed chunk plus the one it is blocked sending.
        let (sink, source, mut remote) = channel(1);

        let task = tokio::spawn(session.bridge.run(
            sink,
            source,
            session.reader,
            session.control,
            session.guard,
        ));

        // The duplex buffer is 256 bytes; with the client not draining, the
        // daemon-side writer must eventually block instead of the bridge
        // buffering everything.
        let write_all = async {
            for _ in 0..64 {
                session.daemon.write_all(&[b'x'; 64]).await.unwrap();
            }
        };
        assert!(
            timeout(Duration::from_millis(200), write_all).await.is_err(),
            "daemon writes should stall while the client is not draining"
        );

        // Draining the client resumes the flow end to end.
        let mut drained = 0usize;
        while drained < 256 {
            match timeout(Duration::from_secs(2), remote.next_event())
                .await
                .unwrap()
                .unwrap()
            {
                ServerEvent::Data(data) => drained += data.len(),
                ServerEvent::Control(_) => {}
            }
        }

        drop(session.daemon);
        drop(remote);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
