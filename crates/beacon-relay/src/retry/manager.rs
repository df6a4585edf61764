//! Retry manager implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::pending::{PendingDelivery, PendingKey};
use crate::message::Message;
use crate::metrics;
use crate::registry::{ConnectionRegistry, SendResult};
use crate::RelayError;

/// Default sweep period in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

/// Default number of re-sends before a delivery is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default minimum gap between two sends of the same entry, in milliseconds.
pub const DEFAULT_MIN_RETRY_DELAY_MS: u64 = 2_500;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Period of the background sweep.
    pub sweep_interval: Duration,

    /// Re-sends allowed before the entry is dropped and reported.
    pub max_retries: u32,

    /// Minimum time between the previous send and a re-send. Keeps a message
    /// registered just before a sweep from being duplicated immediately.
    pub min_retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_delay: Duration::from_millis(DEFAULT_MIN_RETRY_DELAY_MS),
        }
    }
}

impl RetryConfig {
    /// Check that the sweep actually runs and re-sends can keep pace with it.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.sweep_interval.is_zero() {
            return Err(RelayError::config("sweep interval must be non-zero"));
        }
        if self.min_retry_delay > self.sweep_interval {
            return Err(RelayError::config(format!(
                "min retry delay {:?} exceeds sweep interval {:?}",
                self.min_retry_delay, self.sweep_interval
            )));
        }
        Ok(())
    }
}

/// The send primitive a sweep re-sends through.
///
/// Implemented by the dispatcher; kept as a trait so the retry manager does
/// not own the dispatcher that owns it.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, recipient: &str, message: &Message) -> SendResult;
}

/// Receives deliveries that exhausted their retries.
pub trait DeliveryObserver: Send + Sync + 'static {
    fn on_delivery_failed(&self, recipient: &str, message: &Message);
}

/// Default observer: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeliveryObserver;

impl DeliveryObserver for LoggingDeliveryObserver {
    fn on_delivery_failed(&self, recipient: &str, message: &Message) {
        warn!(
            to = %recipient,
            message_id = %message.message_id,
            "Delivery failed after exhausting retries"
        );
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries re-sent to an online recipient
    pub resent: usize,
    /// Entries left alone because the recipient is offline
    pub skipped_offline: usize,
    /// Entries sent too recently to re-send yet
    pub not_due: usize,
    /// Entries dropped and reported to the observer
    pub exhausted: usize,
}

impl SweepReport {
    /// Whether the sweep did anything worth logging.
    pub fn is_idle(&self) -> bool {
        self.resent == 0 && self.exhausted == 0
    }
}

/// Owns every in-flight delivery.
///
/// Entries are keyed by `(recipient, message_id)`; registering the same pair
/// twice keeps the original entry.
pub struct RetryManager {
    config: RetryConfig,
    pending: DashMap<PendingKey, PendingDelivery>,
    registry: Arc<ConnectionRegistry>,
    observer: Arc<dyn DeliveryObserver>,
}

impl RetryManager {
    /// Create a retry manager that logs exhausted deliveries.
    pub fn new(config: RetryConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_observer(config, registry, Arc::new(LoggingDeliveryObserver))
    }

    /// Create a retry manager reporting exhausted deliveries to `observer`.
    pub fn with_observer(
        config: RetryConfig,
        registry: Arc<ConnectionRegistry>,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        Self {
            config,
            pending: DashMap::new(),
            registry,
            observer,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn key_for(recipient: &str, message_id: &str) -> Result<PendingKey, RelayError> {
        if recipient.is_empty() {
            return Err(RelayError::invalid_argument("recipient must not be empty"));
        }
        if message_id.is_empty() {
            return Err(RelayError::invalid_argument("message id must not be empty"));
        }
        Ok(PendingKey::new(recipient, message_id))
    }

    /// Start tracking a delivery.
    ///
    /// Returns false (and changes nothing) if the same message is already
    /// tracked for this recipient.
    #[instrument(skip(self, recipient, message), fields(to = %recipient, message_id = %message.message_id))]
    pub fn add(&self, recipient: &str, message: &Message) -> Result<bool, RelayError> {
        let key = Self::key_for(recipient, &message.message_id)?;
        match self.pending.entry(key) {
            Entry::Occupied(_) => {
                debug!("Delivery already tracked");
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingDelivery::new(
                    recipient,
                    message.clone(),
                    self.config.min_retry_delay,
                ));
                debug!("Tracking delivery");
                Ok(true)
            }
        }
    }

    /// Stop tracking a delivery (acknowledged or cancelled).
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, recipient: &str, message: &Message) -> Result<bool, RelayError> {
        self.cancel(recipient, &message.message_id)
    }

    /// Stop tracking a delivery by message id.
    #[instrument(skip(self))]
    pub fn cancel(&self, recipient: &str, message_id: &str) -> Result<bool, RelayError> {
        let key = Self::key_for(recipient, message_id)?;
        let removed = self.pending.remove(&key).is_some();
        if removed {
            debug!("Delivery no longer tracked");
        }
        Ok(removed)
    }

    /// Run one sweep now.
    pub fn sweep<T: Transmit + ?Sized>(&self, sink: &T) -> SweepReport {
        self.sweep_at(sink, Instant::now())
    }

    /// Run one sweep as of `now`.
    ///
    /// Exhausted entries are removed first and reported after every map
    /// guard is released, so an observer may call back into the manager.
    #[instrument(skip(self, sink, now), name = "beacon.retry.sweep", fields(pending = self.pending.len()))]
    pub fn sweep_at<T: Transmit + ?Sized>(&self, sink: &T, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut exhausted = Vec::new();

        let keys: Vec<PendingKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self
                .pending
                .remove_if(&key, |_, e| e.is_exhausted(self.config.max_retries))
            {
                exhausted.push(entry);
                continue;
            }

            // Gone means acknowledged or cancelled since the snapshot.
            let Some(mut entry) = self.pending.get_mut(&key) else {
                continue;
            };

            if !entry.is_due(now) {
                report.not_due += 1;
                continue;
            }
            if !self.registry.is_online(&key.recipient) {
                report.skipped_offline += 1;
                continue;
            }

            let result = sink.transmit(&key.recipient, &entry.message);
            if result.attempted() {
                entry.record_attempt(now, self.config.min_retry_delay);
                report.resent += 1;
                metrics::record_retry();
                debug!(
                    key = %key,
                    retry_count = entry.retry_count,
                    result = ?result,
                    "Re-sent unacknowledged message"
                );
            } else {
                // Went offline between the check and the send.
                report.skipped_offline += 1;
            }
        }

        for entry in exhausted {
            report.exhausted += 1;
            metrics::record_delivery_failed();
            self.observer
                .on_delivery_failed(&entry.recipient, &entry.message);
        }

        report
    }

    /// Whether a delivery is still tracked.
    pub fn is_pending(&self, recipient: &str, message_id: &str) -> bool {
        self.pending
            .contains_key(&PendingKey::new(recipient, message_id))
    }

    /// Re-sends attempted so far for a tracked delivery.
    pub fn retry_count(&self, recipient: &str, message_id: &str) -> Option<u32> {
        self.pending
            .get(&PendingKey::new(recipient, message_id))
            .map(|e| e.retry_count)
    }

    /// Snapshot of every delivery tracked for a recipient.
    pub fn pending_for(&self, recipient: &str) -> Vec<PendingDelivery> {
        self.pending
            .iter()
            .filter(|e| e.key().recipient == recipient)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Number of tracked deliveries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every tracked delivery without reporting it.
    pub fn clear(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .finish()
    }
}
