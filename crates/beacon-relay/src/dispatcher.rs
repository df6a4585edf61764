//! Message dispatcher.
//!
//! Routes outbound messages to recipients and applies inbound control
//! messages (acknowledgments, heartbeats, logout) coming off a connection.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::framing::encode_frame;
use crate::message::{message_type, Message, MessageSerializer};
use crate::metrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry, SendResult};
use crate::retry::{RetryManager, Transmit};
use crate::RelayError;

/// What an inbound message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    /// Keepalive; nothing beyond the liveness touch
    Heartbeat,
    /// Acknowledgment applied; `matched` is false if nothing was pending
    Acknowledged { matched: bool },
    /// Message forwarded to its recipient
    Forwarded(SendResult),
    /// The connection asked to log out and has been unregistered
    Logout,
    /// Message had nothing to act on
    Ignored,
}

/// Routes messages between connections.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    retry: Arc<RetryManager>,
    serializer: Arc<dyn MessageSerializer>,
    max_frame_length: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        retry: Arc<RetryManager>,
        serializer: Arc<dyn MessageSerializer>,
        max_frame_length: usize,
    ) -> Self {
        Self {
            registry,
            retry,
            serializer,
            max_frame_length,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn serializer(&self) -> &Arc<dyn MessageSerializer> {
        &self.serializer
    }

    /// Serialize and frame a message.
    pub fn encode(&self, message: &Message) -> Result<Bytes, RelayError> {
        let payload = self.serializer.serialize(message)?;
        Ok(encode_frame(&payload, self.max_frame_length)?)
    }

    /// Send a message to a recipient.
    ///
    /// With `track_for_retry` the message is registered for retry before
    /// the write is attempted, so it is never sent but untracked. An
    /// offline recipient is not an error: the write is skipped and a
    /// tracked message waits for the next sweep.
    ///
    /// Fails with `FrameTooLarge` before anything is tracked if the
    /// message does not fit in one frame.
    #[instrument(
        skip(self, recipient, message),
        fields(to = %recipient, message_id = %message.message_id, kind = message.type_name())
    )]
    pub fn send(
        &self,
        recipient: &str,
        message: &Message,
        track_for_retry: bool,
    ) -> Result<SendResult, RelayError> {
        if recipient.is_empty() {
            return Err(RelayError::invalid_argument("recipient must not be empty"));
        }
        let frame = self.encode(message)?;

        if track_for_retry {
            self.retry.add(recipient, message)?;
        }

        let result = self.registry.send_to(recipient, frame);
        metrics::record_routed(message.type_name(), result.as_str());
        if result == SendResult::NotConnected {
            debug!(tracked = track_for_retry, "Recipient offline, write skipped");
        }
        Ok(result)
    }

    /// Write a message to a recipient without tracking it.
    pub fn deliver(&self, recipient: &str, message: &Message) -> Result<SendResult, RelayError> {
        let frame = self.encode(message)?;
        Ok(self.registry.send_to(recipient, frame))
    }

    /// Apply one inbound message from the connection registered as `from`.
    #[instrument(
        skip(self, from, handle, message),
        fields(from = %from, message_id = %message.message_id, kind = message.type_name())
    )]
    pub fn handle_inbound(
        &self,
        from: &str,
        handle: &ConnectionHandle,
        message: Message,
    ) -> Result<InboundAction, RelayError> {
        match message.message_type {
            message_type::HEARTBEAT => Ok(InboundAction::Heartbeat),
            message_type::ACK => {
                let matched = self.retry.cancel(from, &message.message_id)?;
                metrics::record_ack(matched);
                if !matched {
                    debug!("Acknowledgment for a message that is not pending");
                }
                Ok(InboundAction::Acknowledged { matched })
            }
            message_type::LOGOUT => {
                self.registry.unregister(handle);
                handle.close();
                debug!("Client logged out");
                Ok(InboundAction::Logout)
            }
            message_type::HANDSHAKE => {
                warn!("Repeated handshake ignored");
                Ok(InboundAction::Ignored)
            }
            _ if message.to.is_empty() => {
                warn!("Message has no recipient, dropping");
                Ok(InboundAction::Ignored)
            }
            _ => {
                let mut message = message;
                if message.message_id.is_empty() {
                    message.message_id = Uuid::new_v4().to_string();
                    debug!(message_id = %message.message_id, "Assigned id to forwarded message");
                }
                let to = message.to.clone();
                let result = self.send(&to, &message, true)?;
                Ok(InboundAction::Forwarded(result))
            }
        }
    }
}

impl Transmit for Dispatcher {
    fn transmit(&self, recipient: &str, message: &Message) -> SendResult {
        match self.deliver(recipient, message) {
            Ok(result) => result,
            Err(e) => {
                // Counted as a failed attempt so the entry still runs out of retries.
                warn!(to = %recipient, message_id = %message.message_id, error = %e, "Re-send failed");
                SendResult::ChannelClosed
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("max_frame_length", &self.max_frame_length)
            .finish()
    }
}
