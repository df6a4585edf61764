//! Relay message model and the payload serialization collaborator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RelayError;

/// Reserved message type tags.
///
/// Types outside this set are treated as application messages and
/// forwarded like [`CHAT`](message_type::CHAT).
pub mod message_type {
    /// First frame of a connection; `content` is the recipient identifier.
    pub const HANDSHAKE: i32 = 1001;
    /// Keepalive from the client; only refreshes liveness.
    pub const HEARTBEAT: i32 = 1002;
    /// Delivery acknowledgment; `messageId` is the acknowledged message.
    pub const ACK: i32 = 1003;
    /// Application message routed to `to`.
    pub const CHAT: i32 = 1004;
    /// Explicit logout.
    pub const LOGOUT: i32 = 1005;
}

/// Default status stamped on new messages.
pub const STATUS_DEFAULT: i32 = 1;

/// An immutable relay message.
///
/// `message_id` is generated once and is the identity used for
/// acknowledgment matching and retry deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub message_type: i32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub to: String,
}

impl Message {
    /// Create a message with a fresh random id.
    pub fn new(message_type: i32, content: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type,
            content: content.into(),
            status: STATUS_DEFAULT,
            to: to.into(),
        }
    }

    /// Create a chat message addressed to `to`.
    pub fn chat(content: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(message_type::CHAT, content, to)
    }

    /// Create the handshake a client sends to claim `identifier`.
    pub fn handshake(identifier: impl Into<String>) -> Self {
        Self::new(message_type::HANDSHAKE, identifier, "")
    }

    /// Create a heartbeat.
    pub fn heartbeat() -> Self {
        Self::new(message_type::HEARTBEAT, "", "")
    }

    /// Create an acknowledgment for `message_id`.
    pub fn ack(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            message_type: message_type::ACK,
            content: String::new(),
            status: STATUS_DEFAULT,
            to: String::new(),
        }
    }

    /// Create a logout request.
    pub fn logout() -> Self {
        Self::new(message_type::LOGOUT, "", "")
    }

    /// Get the type name for tracing.
    pub fn type_name(&self) -> &'static str {
        match self.message_type {
            message_type::HANDSHAKE => "handshake",
            message_type::HEARTBEAT => "heartbeat",
            message_type::ACK => "ack",
            message_type::CHAT => "chat",
            message_type::LOGOUT => "logout",
            _ => "application",
        }
    }
}

/// Turns messages into frame payloads and back.
///
/// The relay core treats payloads as opaque; this is the only place that
/// knows their encoding.
pub trait MessageSerializer: Send + Sync + 'static {
    fn serialize(&self, message: &Message) -> Result<Bytes, RelayError>;

    fn deserialize(&self, payload: &[u8]) -> Result<Message, RelayError>;
}

/// JSON payloads with camelCase field names.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Message, RelayError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
