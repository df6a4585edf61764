//! Server configuration loaded from `BEACON_*` environment variables.
//!
//! # Environment Variables
//!
//! - `BEACON_LISTEN_ADDR`: Listen address. Default: `0.0.0.0:10010`
//! - `BEACON_READ_IDLE_SECS`: Read idle timeout. Default: `23`
//! - `BEACON_WRITE_IDLE_SECS`: Write idle timeout, `0` disables. Default: `0`
//! - `BEACON_ALL_IDLE_SECS`: Combined idle timeout, `0` disables. Default: `0`
//! - `BEACON_SWEEP_INTERVAL_MS`: Retry sweep period. Default: `5000`
//! - `BEACON_MAX_RETRIES`: Re-sends before a delivery fails. Default: `3`
//! - `BEACON_MIN_RETRY_DELAY_MS`: Minimum gap between sends. Default: `2500`
//! - `BEACON_SEND_QUEUE_CAPACITY`: Outbound frames buffered per connection. Default: `256`
//!
//! Unset or empty variables take the default; anything unparsable is an error.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use beacon_relay::{LivenessConfig, RelayConfig, RetryConfig};
use thiserror::Error;
use tracing::info;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub relay: RelayConfig,
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load server configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RelayConfig::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr: SocketAddr =
            parse_or(get("BEACON_LISTEN_ADDR"), "BEACON_LISTEN_ADDR", defaults.listen_addr)?;

        let liveness = LivenessConfig {
            read_idle_timeout: secs_or(
                get("BEACON_READ_IDLE_SECS"),
                "BEACON_READ_IDLE_SECS",
                defaults.liveness.read_idle_timeout,
            )?,
            write_idle_timeout: secs_or(
                get("BEACON_WRITE_IDLE_SECS"),
                "BEACON_WRITE_IDLE_SECS",
                defaults.liveness.write_idle_timeout,
            )?,
            all_idle_timeout: secs_or(
                get("BEACON_ALL_IDLE_SECS"),
                "BEACON_ALL_IDLE_SECS",
                defaults.liveness.all_idle_timeout,
            )?,
        };

        let retry = RetryConfig {
            sweep_interval: millis_or(
                get("BEACON_SWEEP_INTERVAL_MS"),
                "BEACON_SWEEP_INTERVAL_MS",
                defaults.retry.sweep_interval,
            )?,
            max_retries: parse_or(
                get("BEACON_MAX_RETRIES"),
                "BEACON_MAX_RETRIES",
                defaults.retry.max_retries,
            )?,
            min_retry_delay: millis_or(
                get("BEACON_MIN_RETRY_DELAY_MS"),
                "BEACON_MIN_RETRY_DELAY_MS",
                defaults.retry.min_retry_delay,
            )?,
        };

        let send_queue_capacity = parse_or(
            get("BEACON_SEND_QUEUE_CAPACITY"),
            "BEACON_SEND_QUEUE_CAPACITY",
            defaults.send_queue_capacity,
        )?;

        Ok(Self {
            relay: RelayConfig {
                listen_addr,
                liveness,
                retry,
                send_queue_capacity,
                ..defaults
            },
        })
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        let relay = &self.relay;
        info!("Listen address: {}", relay.listen_addr);
        info!(
            read_idle = ?relay.liveness.read_idle_timeout,
            write_idle = ?relay.liveness.write_idle_timeout,
            all_idle = ?relay.liveness.all_idle_timeout,
            "Liveness thresholds"
        );
        info!(
            sweep_interval = ?relay.retry.sweep_interval,
            max_retries = relay.retry.max_retries,
            min_retry_delay = ?relay.retry.min_retry_delay,
            "Retry policy"
        );
        info!("Send queue capacity: {}", relay.send_queue_capacity);
    }
}

fn parse_or<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs_or(value: Option<String>, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(value, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(
    value: Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(value, key, default_ms).map(Duration::from_millis)
}
