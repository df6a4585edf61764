//! Retry Manager for unacknowledged deliveries.
//!
//! Tracks every message sent with retry tracking until the recipient
//! acknowledges it, the sender cancels it, or it exhausts its retry budget.
//!
//! ## Delivery semantics
//!
//! Delivery is at-least-once. A sweep re-sends an entry only while its
//! recipient is online, so an offline recipient does not burn the budget.
//! Receivers deduplicate by `messageId`: a retry may arrive after the
//! original was received if the acknowledgment was still in flight.
//!
//! ## Cancellation race
//!
//! The sweep re-checks that an entry is still pending and enqueues the
//! re-send while holding that entry's map guard. A `remove` that returns
//! before the sweep reaches the entry always prevents the re-send; a
//! `remove` racing an enqueue that already happened cannot recall the
//! frame, which is at most one extra duplicate.

mod manager;
mod pending;
mod sweeper;

pub use manager::{
    DeliveryObserver, LoggingDeliveryObserver, RetryConfig, RetryManager, SweepReport, Transmit,
};
pub use pending::{PendingDelivery, PendingKey};
pub use sweeper::SweeperHandle;
