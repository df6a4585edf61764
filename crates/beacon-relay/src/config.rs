//! Relay server configuration.

use std::net::SocketAddr;

use crate::framing::MAX_PAYLOAD_LEN;
use crate::liveness::LivenessConfig;
use crate::retry::RetryConfig;
use crate::RelayError;

/// Default TCP port clients connect to.
pub const DEFAULT_PORT: u16 = 10010;

/// Default per-connection outbound queue depth, in frames.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Configuration for a [`RelayServer`](crate::RelayServer).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to accept client connections on
    pub listen_addr: SocketAddr,
    /// Idle detection thresholds
    pub liveness: LivenessConfig,
    /// Retry sweep behavior
    pub retry: RetryConfig,
    /// Frames buffered per connection before new ones are dropped
    pub send_queue_capacity: usize,
    /// Largest frame payload accepted or produced
    pub max_frame_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            liveness: LivenessConfig::default(),
            retry: RetryConfig::default(),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_frame_length: MAX_PAYLOAD_LEN,
        }
    }
}

impl RelayConfig {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.send_queue_capacity == 0 {
            return Err(RelayError::config("send queue capacity must be non-zero"));
        }
        if self.max_frame_length == 0 || self.max_frame_length > MAX_PAYLOAD_LEN {
            return Err(RelayError::config(format!(
                "max frame length must be between 1 and {MAX_PAYLOAD_LEN}"
            )));
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr.port(), 10010);
        assert_eq!(config.max_frame_length, 65_535);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = RelayConfig {
            send_queue_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            max_frame_length: 70_000,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
