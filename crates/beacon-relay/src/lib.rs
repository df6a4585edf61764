//! # beacon-relay
//!
//! Push-messaging relay delivery core.
//!
//! Clients hold a long-lived TCP connection, identify themselves with a
//! handshake, and exchange length-prefixed messages through the relay.
//! Messages sent with retry tracking are re-sent until the recipient
//! acknowledges them or the retry budget runs out.
//!
//! ## Architecture
//!
//! - **Framing**: `u16` big-endian length prefix, payload up to 65535 bytes
//! - **Registry**: recipient identifier to live connection, and back
//! - **Liveness**: read idle detection closes dead connections
//! - **Retry**: pending deliveries swept on a fixed period
//! - **Dispatcher**: routes outbound messages and applies inbound control messages
//! - **Server**: accept loop with one task per connection
//!
//! ```text
//! socket -> FrameCodec -> liveness touch -> deserialize -> Dispatcher
//!                                                             |
//!              RetryManager (sweep) ---------> Registry <-----+
//!                                                 |
//!                                      per-connection send queue -> socket
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod framing;
pub mod liveness;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod server;

mod error;

pub use config::RelayConfig;
pub use connection::{CloseReason, ConnectionActor};
pub use dispatcher::{Dispatcher, InboundAction};
pub use error::RelayError;
pub use framing::{FrameCodec, FrameError};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use message::{message_type, JsonSerializer, Message, MessageSerializer};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, SendResult};
pub use retry::{DeliveryObserver, RetryConfig, RetryManager, SweepReport, Transmit};
pub use server::RelayServer;
