//! Connection Registry implementation.
//!
//! Tracks live connections by recipient identifier, with a reverse index by
//! connection id for cleanup on close.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Process-unique identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of attempting to queue a frame for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Sent,
    /// The recipient is not currently connected
    NotConnected,
    /// The connection's outbound queue is full (slow consumer); frame dropped
    ChannelFull,
    /// The connection's outbound queue is closed
    ChannelClosed,
}

impl SendResult {
    /// Whether a write was attempted against a live handle.
    pub fn attempted(&self) -> bool {
        !matches!(self, SendResult::NotConnected)
    }

    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SendResult::Sent => "sent",
            SendResult::NotConnected => "not_connected",
            SendResult::ChannelFull => "channel_full",
            SendResult::ChannelClosed => "channel_closed",
        }
    }
}

/// Transport-level write and close capability for one connection.
///
/// Cloning is cheap; all clones refer to the same connection. Equality is
/// connection identity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    sender: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle around a connection's outbound queue and close token.
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        sender: mpsc::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            sender,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue an already-framed buffer without waiting.
    pub fn try_send(&self, frame: Bytes) -> SendResult {
        match self.sender.try_send(frame) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendResult::ChannelFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }

    /// Ask the connection task to close the transport.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the connection is closing or gone.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

#[derive(Default)]
struct RegistryMaps {
    by_recipient: HashMap<String, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, String>,
}

/// Registry mapping recipients to their live connection.
///
/// Both indexes live behind one lock so every caller observes a consistent
/// pair; a reader can never see a recipient whose reverse entry is missing.
/// Critical sections are short map operations and never await.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // After the handshake:
/// let handle = ConnectionHandle::new(registry.next_connection_id(), peer, tx, token);
/// if let Some(previous) = registry.register("alice", handle.clone()) {
///     previous.close();
/// }
///
/// // When routing:
/// let result = registry.send_to("alice", frame);
///
/// // When the connection closes:
/// registry.unregister(&handle);
/// ```
pub struct ConnectionRegistry {
    maps: RwLock<RegistryMaps>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            maps: RwLock::new(RegistryMaps::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a newly accepted connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // A panic while holding the lock cannot leave the maps half-updated
    // (each mutation is a single insert/remove pair), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, RegistryMaps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryMaps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection for a recipient.
    ///
    /// Replaces any existing association and returns the superseded handle;
    /// closing it is the caller's responsibility. The superseded handle's
    /// reverse entry is dropped so its later `unregister` is a no-op.
    #[instrument(skip(self, recipient, handle), fields(recipient = %recipient, conn = %handle.id()))]
    pub fn register(&self, recipient: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let recipient = recipient.to_string();
        let mut maps = self.write();

        // A handle re-registering under a new name must not leave its old name behind.
        if let Some(old_name) = maps.by_connection.insert(handle.id(), recipient.clone()) {
            if old_name != recipient
                && maps
                    .by_recipient
                    .get(&old_name)
                    .is_some_and(|h| h.id() == handle.id())
            {
                maps.by_recipient.remove(&old_name);
            }
        }

        let previous = maps.by_recipient.insert(recipient, handle.clone());
        match previous {
            Some(prev) if prev.id() != handle.id() => {
                maps.by_connection.remove(&prev.id());
                debug!(superseded = %prev.id(), "Replaced existing connection registration");
                Some(prev)
            }
            Some(_) => None,
            None => {
                debug!("Registered new connection");
                None
            }
        }
    }

    /// Unregister a connection.
    ///
    /// Returns the recipient it was serving. A handle that was already
    /// removed or superseded leaves the current mapping untouched.
    #[instrument(skip(self, handle), fields(conn = %handle.id()))]
    pub fn unregister(&self, handle: &ConnectionHandle) -> Option<String> {
        self.unregister_id(handle.id())
    }

    /// Unregister by connection id.
    pub fn unregister_id(&self, id: ConnectionId) -> Option<String> {
        let mut maps = self.write();
        let Some(recipient) = maps.by_connection.remove(&id) else {
            debug!(conn = %id, "Connection was not registered");
            return None;
        };

        if maps
            .by_recipient
            .get(&recipient)
            .is_some_and(|h| h.id() == id)
        {
            maps.by_recipient.remove(&recipient);
        }
        debug!(conn = %id, recipient = %recipient, "Unregistered connection");
        Some(recipient)
    }

    /// Check if a recipient currently has a live connection.
    pub fn is_online(&self, recipient: &str) -> bool {
        self.read().by_recipient.contains_key(recipient)
    }

    /// Get the current handle for a recipient.
    pub fn lookup(&self, recipient: &str) -> Option<ConnectionHandle> {
        self.read().by_recipient.get(recipient).cloned()
    }

    /// Get the recipient a connection is registered under.
    pub fn identifier_of(&self, handle: &ConnectionHandle) -> Option<String> {
        self.read().by_connection.get(&handle.id()).cloned()
    }

    /// Get the number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.read().by_recipient.len()
    }

    /// List all online recipients.
    ///
    /// Useful for debugging and monitoring.
    pub fn list_recipients(&self) -> Vec<String> {
        self.read().by_recipient.keys().cloned().collect()
    }

    /// Queue a frame for a recipient's connection.
    ///
    /// A closed queue means the connection task is gone; the stale handle is
    /// unregistered on the spot.
    #[instrument(skip(self, frame), fields(to = %recipient, len = frame.len()))]
    pub fn send_to(&self, recipient: &str, frame: Bytes) -> SendResult {
        let Some(handle) = self.lookup(recipient) else {
            debug!("Recipient not connected");
            return SendResult::NotConnected;
        };

        let result = handle.try_send(frame);
        match result {
            SendResult::Sent => debug!("Frame queued for delivery"),
            SendResult::ChannelFull => {
                warn!(conn = %handle.id(), "Outbound queue full, dropping frame")
            }
            SendResult::ChannelClosed => {
                debug!(conn = %handle.id(), "Outbound queue closed, connection may have dropped");
                self.unregister(&handle);
            }
            SendResult::NotConnected => {}
        }
        result
    }

    /// Remove all stale connections (those with closed queues or tokens).
    ///
    /// This can be called periodically to clean up connections whose task
    /// ended without unregistering.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<ConnectionId> = self
            .read()
            .by_recipient
            .values()
            .filter(|h| h.is_closed())
            .map(|h| h.id())
            .collect();

        let removed = stale
            .into_iter()
            .filter(|id| self.unregister_id(*id).is_some())
            .count();

        if removed > 0 {
            info!(count = removed, "Cleaned up stale connections");
        }
        removed
    }

    /// Close and forget every connection.
    pub fn close_all(&self) -> usize {
        let mut maps = self.write();
        let count = maps.by_recipient.len();
        for handle in maps.by_recipient.values() {
            handle.close();
        }
        maps.by_recipient.clear();
        maps.by_connection.clear();
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connection_count())
            .finish()
    }
}
