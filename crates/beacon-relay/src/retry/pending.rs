//! Pending-delivery entries held by the retry manager.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::Message;

/// Identity of a pending delivery: one entry per recipient and message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub recipient: String,
    pub message_id: String,
}

impl PendingKey {
    pub fn new(recipient: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.recipient, self.message_id)
    }
}

/// A message sent but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Who the message is for
    pub recipient: String,
    /// The message exactly as first sent
    pub message: Message,
    /// Re-sends attempted so far (the original send is not counted)
    pub retry_count: u32,
    /// Earliest instant the next re-send may happen
    pub next_retry_at: Instant,
}

impl PendingDelivery {
    /// Create an entry with no retries, eligible after `delay`.
    pub fn new(recipient: impl Into<String>, message: Message, delay: Duration) -> Self {
        Self {
            recipient: recipient.into(),
            message,
            retry_count: 0,
            next_retry_at: Instant::now() + delay,
        }
    }

    pub fn key(&self) -> PendingKey {
        PendingKey::new(self.recipient.clone(), self.message.message_id.clone())
    }

    /// Whether a re-send is allowed at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_retry_at
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Record a re-send at `now`.
    pub fn record_attempt(&mut self, now: Instant, delay: Duration) {
        self.retry_count += 1;
        self.next_retry_at = now + delay;
    }
}
