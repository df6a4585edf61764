//! Connection Registry for recipient routing.
//!
//! This module provides a thread-safe registry that maps recipient
//! identifiers to the live connection currently serving them, and is the
//! single source of truth for "is X reachable right now".
//!
//! ## Architecture
//!
//! Each connection registers a handle after its handshake. The handle owns a
//! bounded outbound queue drained by the connection task, so routing a frame
//! never waits on a slow socket.
//!
//! ```text
//! Connection task (alice) <-> ConnectionRegistry <-> Connection task (bob)
//!        |                           |                        |
//!        v                           v                        v
//!   mpsc::Receiver         by_recipient / by_connection   mpsc::Receiver
//! ```

mod connection_registry;

pub use connection_registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, SendResult};
