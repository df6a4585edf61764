//! Relay metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider. Without an installed
//! provider every instrument is a no-op, so the library never requires one.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("beacon-relay"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for frames decoded from or written to connections.
pub fn frames() -> Counter<u64> {
    meter()
        .u64_counter("beacon.frames")
        .with_description("Total frames read and written")
        .with_unit("frame")
        .build()
}

/// Counter for messages routed to a recipient.
pub fn messages_routed() -> Counter<u64> {
    meter()
        .u64_counter("beacon.messages.routed")
        .with_description("Total messages routed to a recipient")
        .with_unit("message")
        .build()
}

/// Counter for retry re-sends.
pub fn retries() -> Counter<u64> {
    meter()
        .u64_counter("beacon.retry.resends")
        .with_description("Total re-sends of unacknowledged messages")
        .with_unit("message")
        .build()
}

/// Counter for acknowledgments received.
pub fn acks() -> Counter<u64> {
    meter()
        .u64_counter("beacon.retry.acks")
        .with_description("Total acknowledgments received")
        .with_unit("ack")
        .build()
}

/// Counter for deliveries that exhausted their retries.
pub fn delivery_failures() -> Counter<u64> {
    meter()
        .u64_counter("beacon.delivery.failed")
        .with_description("Total deliveries abandoned after exhausting retries")
        .with_unit("message")
        .build()
}

/// Counter for connections closed by idle detection.
pub fn idle_disconnects() -> Counter<u64> {
    meter()
        .u64_counter("beacon.liveness.disconnects")
        .with_description("Total connections closed for read idleness")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for registered connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("beacon.connections.active")
        .with_description("Current number of registered connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a frame crossing a connection.
pub fn record_frame(direction: &'static str) {
    frames().add(1, &[KeyValue::new("direction", direction)]);
}

/// Record a message routed to a recipient.
pub fn record_routed(message_type: &'static str, result: &str) {
    messages_routed().add(
        1,
        &[
            KeyValue::new("type", message_type),
            KeyValue::new("result", result.to_string()),
        ],
    );
}

/// Record a retry re-send.
pub fn record_retry() {
    retries().add(1, &[]);
}

/// Record an acknowledgment, and whether it matched a pending delivery.
pub fn record_ack(matched: bool) {
    acks().add(
        1,
        &[KeyValue::new("result", if matched { "matched" } else { "unknown" })],
    );
}

/// Record a delivery that exhausted its retries.
pub fn record_delivery_failed() {
    delivery_failures().add(1, &[]);
}

/// Record an idle disconnect.
pub fn record_idle_disconnect() {
    idle_disconnects().add(1, &[]);
}

/// Record the registered connection count.
pub fn record_connection_count(count: i64) {
    connections_active().record(count, &[]);
}
