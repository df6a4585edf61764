//! Test utilities for relay end-to-end testing.
//!
//! Provides a relay server on an ephemeral port and a framed client that
//! speaks the relay protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_relay::{
    DeliveryObserver, FrameCodec, JsonSerializer, LivenessConfig, Message, MessageSerializer,
    RelayConfig, RelayServer, RetryConfig,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test log subscriber once per process.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Relay settings scaled down for tests.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        liveness: LivenessConfig::read_only(Duration::from_secs(10)),
        retry: RetryConfig {
            sweep_interval: Duration::from_millis(200),
            max_retries: 3,
            min_retry_delay: Duration::from_millis(100),
        },
        ..RelayConfig::default()
    }
}

/// Records deliveries that exhausted their retries.
#[derive(Default)]
pub struct RecordingObserver {
    failed: Mutex<Vec<(String, String)>>,
}

impl RecordingObserver {
    pub fn failed(&self) -> Vec<(String, String)> {
        self.failed.lock().unwrap().clone()
    }
}

impl DeliveryObserver for RecordingObserver {
    fn on_delivery_failed(&self, recipient: &str, message: &Message) {
        self.failed
            .lock()
            .unwrap()
            .push((recipient.to_string(), message.message_id.clone()));
    }
}

/// Test server handle.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<RelayServer>,
    pub observer: Arc<RecordingObserver>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a relay with [`test_config`].
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    /// Start a relay with custom settings on an available port.
    pub async fn start_with(config: RelayConfig) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let observer = Arc::new(RecordingObserver::default());
        let server = Arc::new(
            RelayServer::with_collaborators(
                config,
                Arc::new(JsonSerializer),
                Arc::clone(&observer) as Arc<dyn DeliveryObserver>,
            )
            .expect("Invalid test config"),
        );

        let shutdown = CancellationToken::new();
        let serving = Arc::clone(&server);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve(listener, token).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Self {
            addr,
            server,
            observer,
            shutdown,
        }
    }

    /// Wait until a recipient is registered (or not).
    pub async fn wait_online(&self, recipient: &str, online: bool) {
        let registry = self.server.registry();
        let result = timeout(DEFAULT_TIMEOUT, async {
            while registry.is_online(recipient) != online {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "{recipient} did not become {}",
            if online { "online" } else { "offline" }
        );
    }

    /// Wait until nothing is pending for a recipient.
    pub async fn wait_no_pending(&self, recipient: &str) {
        let retry = self.server.retry_manager();
        let result = timeout(DEFAULT_TIMEOUT, async {
            while !retry.pending_for(recipient).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "deliveries to {recipient} still pending");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Relay protocol test client.
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    /// Open a connection without handshaking.
    pub async fn connect_raw(server: &TestServer) -> Self {
        let stream = TcpStream::connect(server.addr)
            .await
            .expect("Failed to connect to test server");
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Connect and handshake as `identifier`, waiting for registration.
    pub async fn connect(server: &TestServer, identifier: &str) -> Self {
        let mut client = Self::connect_raw(server).await;
        client.send(&Message::handshake(identifier)).await;
        server.wait_online(identifier, true).await;
        client
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) {
        let payload = JsonSerializer.serialize(message).unwrap();
        self.send_payload(payload).await;
    }

    /// Send a raw payload in one frame.
    pub async fn send_payload(&mut self, payload: Bytes) {
        self.framed.send(payload).await.expect("Failed to send frame");
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, data: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.framed
            .get_mut()
            .write_all(data)
            .await
            .expect("Failed to write");
    }

    /// Receive the next message, or `None` on timeout.
    pub async fn recv(&mut self, timeout_dur: Duration) -> Option<Message> {
        match timeout(timeout_dur, self.framed.next()).await {
            Ok(Some(Ok(payload))) => Some(JsonSerializer.deserialize(&payload).unwrap()),
            Ok(Some(Err(e))) => panic!("Frame error: {e}"),
            Ok(None) => None,
            Err(_) => None,
        }
    }

    /// Receive the next message, failing the test on timeout.
    pub async fn expect_message(&mut self) -> Message {
        self.recv(DEFAULT_TIMEOUT)
            .await
            .expect("Expected a message before timeout")
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self, timeout_dur: Duration) {
        match timeout(timeout_dur, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => {}
            Ok(Some(Ok(payload))) => panic!("Expected close, got {} byte frame", payload.len()),
            Err(_) => panic!("Connection still open after {timeout_dur:?}"),
        }
    }
}
