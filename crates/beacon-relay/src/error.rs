//! Error types for the push relay.

use thiserror::Error;

use crate::framing::FrameError;

/// Push relay errors.
///
/// Offline recipients and exhausted retries are deliberately absent: the
/// former is reported as [`SendResult::NotConnected`](crate::registry::SendResult)
/// and the latter through a [`DeliveryObserver`](crate::retry::DeliveryObserver).
#[derive(Debug, Error)]
pub enum RelayError {
    /// IO error (network, socket)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound payload does not fit in a single frame
    #[error("Frame too large: {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Payload length that was rejected
        len: usize,
        /// Configured frame limit
        max: usize,
    },

    /// Inbound frame violated the framing invariants
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Caller broke an API contract (empty recipient, missing message id)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Create a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Every variant here is either a contract violation or a property of
    /// the payload itself, so only transport errors qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<FrameError> for RelayError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { len, max } => Self::FrameTooLarge { len, max },
            FrameError::Malformed(msg) => Self::MalformedFrame(msg),
            FrameError::Io(e) => Self::Io(e),
        }
    }
}
