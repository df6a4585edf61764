//! Connection task for a single client connection.
//!
//! Each inbound frame passes through the same ordered stages: framing
//! decode, liveness touch, payload deserialize, dispatch. Outbound frames
//! arrive already framed on the connection's send queue and are written
//! as-is.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RelayConfig;
use crate::dispatcher::{Dispatcher, InboundAction};
use crate::framing::PreframedCodec;
use crate::liveness::{ActivityClock, ActivityStream, IdleAction, LivenessMonitor};
use crate::message::{message_type, Message};
use crate::metrics;
use crate::registry::ConnectionHandle;
use crate::RelayError;

/// Why a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream
    PeerClosed,
    /// First frame was not a valid handshake
    HandshakeRejected,
    /// No inbound traffic within the read idle timeout
    IdleTimeout,
    /// Client sent a logout
    Logout,
    /// Closed by the server (shutdown or superseded by a newer connection)
    Shutdown,
}

/// Actor managing a single client connection.
pub struct ConnectionActor<T> {
    peer: SocketAddr,
    framed: Framed<ActivityStream<T>, PreframedCodec>,
    activity: ActivityClock,
    liveness: LivenessMonitor,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    send_queue_capacity: usize,
}

impl<T> ConnectionActor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Handle a newly accepted connection until it closes.
    ///
    /// `shutdown` closes this connection only; it doubles as the close
    /// token of the registered handle.
    #[instrument(
        name = "beacon.connection.handle",
        skip(stream, dispatcher, config, shutdown),
        fields(peer = %peer, recipient = tracing::field::Empty)
    )]
    pub async fn handle_connection(
        stream: T,
        peer: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Result<CloseReason, RelayError> {
        debug!("New connection");

        let activity = ActivityClock::new();
        let mut actor = Self {
            peer,
            framed: Framed::new(
                ActivityStream::new(stream, activity.clone()),
                PreframedCodec::new(config.max_frame_length),
            ),
            activity,
            liveness: LivenessMonitor::new(config.liveness),
            dispatcher,
            shutdown,
            send_queue_capacity: config.send_queue_capacity,
        };

        let result = actor.run().await;
        actor.liveness.mark_closed();
        match &result {
            Ok(reason) => info!(?reason, "Connection closed"),
            Err(e) => warn!(error = %e, "Connection closed with error"),
        }
        result
    }

    async fn run(&mut self) -> Result<CloseReason, RelayError> {
        let identifier = match self.await_handshake().await? {
            Ok(identifier) => identifier,
            Err(reason) => return Ok(reason),
        };

        let registry = Arc::clone(self.dispatcher.registry());
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let handle = ConnectionHandle::new(
            registry.next_connection_id(),
            self.peer,
            tx,
            self.shutdown.clone(),
        );

        if let Some(previous) = registry.register(&identifier, handle.clone()) {
            info!(
                superseded = %previous.id(),
                previous_peer = %previous.peer(),
                "Closing superseded connection"
            );
            previous.close();
        }
        tracing::Span::current().record("recipient", identifier.as_str());
        metrics::record_connection_count(registry.connection_count() as i64);
        info!(recipient = %identifier, conn = %handle.id(), "Session established");

        let result = self.process_frames(&identifier, &handle, rx).await;

        // Only our own registration; a newer connection for the same
        // recipient is left alone.
        registry.unregister(&handle);
        metrics::record_connection_count(registry.connection_count() as i64);
        result
    }

    /// Wait for the handshake frame and return the claimed identifier.
    async fn await_handshake(&mut self) -> Result<Result<String, CloseReason>, RelayError> {
        loop {
            let deadline = self.liveness.idle_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(Err(CloseReason::Shutdown)),
                frame = self.framed.next() => {
                    let payload = match frame {
                        None => return Ok(Err(CloseReason::PeerClosed)),
                        Some(frame) => frame?,
                    };
                    self.liveness.record_read();
                    metrics::record_frame("in");

                    return Ok(match self.decode(&payload) {
                        Some(message)
                            if message.message_type == message_type::HANDSHAKE
                                && !message.content.is_empty() =>
                        {
                            Ok(message.content)
                        }
                        _ => {
                            warn!("First frame was not a handshake, closing connection");
                            Err(CloseReason::HandshakeRejected)
                        }
                    });
                }
                _ = sleep_until(deadline) => {
                    if self.check_idle() {
                        return Ok(Err(CloseReason::IdleTimeout));
                    }
                }
            }
        }
    }

    /// Main loop after the handshake.
    async fn process_frames(
        &mut self,
        identifier: &str,
        handle: &ConnectionHandle,
        mut outbound: mpsc::Receiver<Bytes>,
    ) -> Result<CloseReason, RelayError> {
        loop {
            let deadline = self.liveness.idle_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(CloseReason::Shutdown),
                frame = self.framed.next() => {
                    let payload = match frame {
                        None => return Ok(CloseReason::PeerClosed),
                        Some(frame) => frame?,
                    };
                    self.liveness.record_read();
                    metrics::record_frame("in");

                    let Some(message) = self.decode(&payload) else {
                        continue;
                    };
                    match self.dispatcher.handle_inbound(identifier, handle, message) {
                        Ok(InboundAction::Logout) => return Ok(CloseReason::Logout),
                        Ok(action) => debug!(?action, "Inbound message handled"),
                        Err(e) => warn!(error = %e, "Error handling message"),
                    }
                }
                frame = outbound.recv() => {
                    // The handle keeps a sender alive, so the queue cannot close
                    // while this loop runs.
                    let Some(frame) = frame else {
                        return Ok(CloseReason::Shutdown);
                    };
                    if let Some(reason) = self.write_frame(frame).await? {
                        return Ok(reason);
                    }
                }
                _ = sleep_until(deadline) => {
                    if self.check_idle() {
                        return Ok(CloseReason::IdleTimeout);
                    }
                }
            }
        }
    }

    /// Write one outbound frame.
    ///
    /// A peer that stops reading can stall the write indefinitely, so the
    /// write races shutdown and the idle deadline. Inbound frames are not
    /// read while a write is pending. Returns the close reason if the
    /// connection ended before the write finished.
    async fn write_frame(&mut self, frame: Bytes) -> Result<Option<CloseReason>, RelayError> {
        let write = self.framed.send(frame);
        tokio::pin!(write);

        loop {
            let deadline = self.liveness.idle_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(Some(CloseReason::Shutdown)),
                result = &mut write => {
                    result?;
                    break;
                }
                _ = sleep_until(deadline) => {
                    if idle_elapsed(&mut self.liveness, &self.activity) {
                        warn!("Write stalled past the read idle timeout");
                        return Ok(Some(CloseReason::IdleTimeout));
                    }
                }
            }
        }

        self.liveness.record_write();
        metrics::record_frame("out");
        Ok(None)
    }

    /// Payloads that fail to deserialize are skipped, not fatal.
    fn decode(&self, payload: &[u8]) -> Option<Message> {
        match self.dispatcher.serializer().deserialize(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, len = payload.len(), "Skipping undecodable payload");
                None
            }
        }
    }

    fn check_idle(&mut self) -> bool {
        idle_elapsed(&mut self.liveness, &self.activity)
    }
}

/// Apply any elapsed idle threshold. Returns true if the connection should
/// be closed.
///
/// Takes the liveness fields alone so it can run while the transport is
/// borrowed by a pending write.
fn idle_elapsed(liveness: &mut LivenessMonitor, activity: &ActivityClock) -> bool {
    // Bytes of a partial frame count as activity too.
    liveness.record_read_at(activity.last());

    let Some(event) = liveness.poll_idle(Instant::now()) else {
        return false;
    };
    match liveness.on_idle(event) {
        IdleAction::Disconnect => {
            metrics::record_idle_disconnect();
            info!(?event, "Read idle timeout, closing connection");
            true
        }
        IdleAction::Ignore => false,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{encode_frame, FrameCodec};
    use crate::liveness::LivenessConfig;
    use crate::message::{JsonSerializer, MessageSerializer};
    use crate::registry::ConnectionRegistry;
    use crate::retry::{RetryConfig, RetryManager};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    fn test_dispatcher() -> Arc<Dispatcher> {
        let registry = Arc::new(ConnectionRegistry::new());
        let retry = Arc::new(RetryManager::new(
            RetryConfig::default(),
            Arc::clone(&registry),
        ));
        Arc::new(Dispatcher::new(
            registry,
            retry,
            Arc::new(JsonSerializer),
            crate::framing::MAX_PAYLOAD_LEN,
        ))
    }

    fn spawn_actor(
        dispatcher: &Arc<Dispatcher>,
        read_idle: Duration,
    ) -> (
        Framed<DuplexStream, FrameCodec>,
        CancellationToken,
        JoinHandle<Result<CloseReason, RelayError>>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let config = RelayConfig {
            liveness: LivenessConfig::read_only(read_idle),
            ..RelayConfig::default()
        };
        let token = CancellationToken::new();
        let task = tokio::spawn(ConnectionActor::handle_connection(
            server,
            "127.0.0.1:40000".parse().unwrap(),
            Arc::clone(dispatcher),
            config,
            token.clone(),
        ));
        (Framed::new(client, FrameCodec::default()), token, task)
    }

    async fn send(client: &mut Framed<DuplexStream, FrameCodec>, message: &Message) {
        client
            .send(JsonSerializer.serialize(message).unwrap())
            .await
            .unwrap();
    }

    async fn wait_online(dispatcher: &Dispatcher, recipient: &str) {
        for _ in 0..100 {
            if dispatcher.registry().is_online(recipient) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{recipient} never registered");
    }

    #[tokio::test]
    async fn test_handshake_registers_and_close_unregisters() {
        let dispatcher = test_dispatcher();
        let (mut client, _token, task) = spawn_actor(&dispatcher, Duration::from_secs(30));

        send(&mut client, &Message::handshake("alice")).await;
        wait_online(&dispatcher, "alice").await;

        drop(client);
        assert_eq!(task.await.unwrap().unwrap(), CloseReason::PeerClosed);
        assert!(!dispatcher.registry().is_online("alice"));
    }

    #[tokio::test]
    async fn test_non_handshake_first_frame_is_rejected() {
        let dispatcher = test_dispatcher();
        let (mut client, _token, task) = spawn_actor(&dispatcher, Duration::from_secs(30));

        send(&mut client, &Message::chat("hi", "bob")).await;

        assert_eq!(task.await.unwrap().unwrap(), CloseReason::HandshakeRejected);
        assert_eq!(dispatcher.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_client() {
        let dispatcher = test_dispatcher();
        let (mut client, token, task) = spawn_actor(&dispatcher, Duration::from_secs(30));

        send(&mut client, &Message::handshake("alice")).await;
        wait_online(&dispatcher, "alice").await;

        let msg = Message::chat("hello", "alice");
        dispatcher.send("alice", &msg, false).unwrap();

        let payload = client.next().await.unwrap().unwrap();
        assert_eq!(JsonSerializer.deserialize(&payload).unwrap(), msg);

        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_skipped() {
        let dispatcher = test_dispatcher();
        let (mut client, token, task) = spawn_actor(&dispatcher, Duration::from_secs(30));

        send(&mut client, &Message::handshake("alice")).await;
        client.send(Bytes::from_static(b"not json")).await.unwrap();
        send(&mut client, &Message::heartbeat()).await;
        wait_online(&dispatcher, "alice").await;

        assert!(!task.is_finished());
        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_logout_closes_connection() {
        let dispatcher = test_dispatcher();
        let (mut client, _token, task) = spawn_actor(&dispatcher, Duration::from_secs(30));

        send(&mut client, &Message::handshake("alice")).await;
        send(&mut client, &Message::logout()).await;

        assert_eq!(task.await.unwrap().unwrap(), CloseReason::Logout);
        assert!(!dispatcher.registry().is_online("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_times_out() {
        let dispatcher = test_dispatcher();
        let (mut client, _token, task) = spawn_actor(&dispatcher, Duration::from_secs(5));

        send(&mut client, &Message::handshake("alice")).await;

        assert_eq!(task.await.unwrap().unwrap(), CloseReason::IdleTimeout);
        assert!(!dispatcher.registry().is_online("alice"));
        // The transport is gone.
        assert!(client.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickled_bytes_keep_connection_alive() {
        let dispatcher = test_dispatcher();
        let (mut client, token, task) = spawn_actor(&dispatcher, Duration::from_secs(5));

        send(&mut client, &Message::handshake("alice")).await;

        // One byte of a heartbeat frame every 4 seconds.
        let payload = JsonSerializer.serialize(&Message::heartbeat()).unwrap();
        let frame = encode_frame(&payload, 1024).unwrap();
        for byte in frame.iter().take(6) {
            tokio::time::sleep(Duration::from_secs(4)).await;
            client.get_mut().write_all(&[*byte]).await.unwrap();
        }

        assert!(!task.is_finished());
        assert!(dispatcher.registry().is_online("alice"));
        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), CloseReason::Shutdown);
    }

    /// Actor behind a small transport buffer, so a large outbound frame
    /// blocks until the client reads.
    fn spawn_narrow_actor(
        dispatcher: &Arc<Dispatcher>,
        read_idle: Duration,
    ) -> (
        DuplexStream,
        CancellationToken,
        JoinHandle<Result<CloseReason, RelayError>>,
    ) {
        let (client, server) = tokio::io::duplex(64);
        let config = RelayConfig {
            liveness: LivenessConfig::read_only(read_idle),
            ..RelayConfig::default()
        };
        let token = CancellationToken::new();
        let task = tokio::spawn(ConnectionActor::handle_connection(
            server,
            "127.0.0.1:40000".parse().unwrap(),
            Arc::clone(dispatcher),
            config,
            token.clone(),
        ));
        (client, token, task)
    }

    async fn handshake_raw(client: &mut DuplexStream, identifier: &str) {
        let payload = JsonSerializer.serialize(&Message::handshake(identifier)).unwrap();
        let frame = encode_frame(&payload, 1024).unwrap();
        client.write_all(&frame).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_still_times_out() {
        let dispatcher = test_dispatcher();
        let (mut client, _token, task) = spawn_narrow_actor(&dispatcher, Duration::from_secs(5));

        handshake_raw(&mut client, "alice").await;
        wait_online(&dispatcher, "alice").await;

        // The client never reads, so this write cannot complete.
        dispatcher
            .send("alice", &Message::chat("x".repeat(1000), "alice"), false)
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("connection stayed open behind a stalled write");
        assert_eq!(outcome.unwrap().unwrap(), CloseReason::IdleTimeout);
        assert!(!dispatcher.registry().is_online("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_yields_to_shutdown() {
        let dispatcher = test_dispatcher();
        let (mut client, token, task) = spawn_narrow_actor(&dispatcher, Duration::from_secs(30));

        handshake_raw(&mut client, "alice").await;
        wait_online(&dispatcher, "alice").await;

        dispatcher
            .send("alice", &Message::chat("x".repeat(1000), "alice"), false)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());

        token.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("shutdown did not interrupt the stalled write");
        assert_eq!(outcome.unwrap().unwrap(), CloseReason::Shutdown);
        assert!(!dispatcher.registry().is_online("alice"));
    }

    #[tokio::test]
    async fn test_oversized_declared_length_is_fatal() {
        let dispatcher = test_dispatcher();
        let (client, server) = tokio::io::duplex(64);
        let config = RelayConfig {
            max_frame_length: 16,
            ..RelayConfig::default()
        };
        let task = tokio::spawn(ConnectionActor::handle_connection(
            server,
            "127.0.0.1:40000".parse().unwrap(),
            Arc::clone(&dispatcher),
            config,
            CancellationToken::new(),
        ));

        let mut client = client;
        client.write_all(&[0x00, 0xff]).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::MalformedFrame(_)));
    }
}
