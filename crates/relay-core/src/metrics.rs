//! Hub instrumentation.
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op. The server installs the Prometheus exporter.

use metrics::{counter, gauge, histogram};

use crate::stream::FanOut;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "relay_connections_rejected_total";
    pub const STREAMS_ACTIVE: &str = "relay_streams_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "relay_subscriptions_active";
    pub const ITEMS_PUBLISHED: &str = "relay_items_published_total";
    pub const ITEMS_DELIVERED: &str = "relay_items_delivered_total";
    pub const ITEMS_DROPPED: &str = "relay_items_dropped_total";
    pub const OVERFLOWS_TOTAL: &str = "relay_overflows_total";
    pub const EVENTS_TOTAL: &str = "relay_events_total";
    pub const WRITE_SECONDS: &str = "relay_write_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused connection.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Update the number of broadcasting streams.
pub fn set_active_streams(count: usize) {
    gauge!(names::STREAMS_ACTIVE).set(count as f64);
}

/// Record a subscription.
pub fn record_subscription(stream: &str) {
    counter!(names::SUBSCRIPTIONS_TOTAL, "stream" => stream.to_string()).increment(1);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).increment(1.0);
}

/// Record a subscription ending.
pub fn record_unsubscription() {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).decrement(1.0);
}

/// Record an item taken from a publisher.
pub fn record_published(stream: &str) {
    counter!(names::ITEMS_PUBLISHED, "stream" => stream.to_string()).increment(1);
}

/// Record the outcome of one fan-out.
pub fn record_fan_out(stream: &str, result: &FanOut) {
    if result.delivered > 0 {
        counter!(names::ITEMS_DELIVERED, "stream" => stream.to_string())
            .increment(result.delivered as u64);
    }
    if result.dropped > 0 {
        counter!(names::ITEMS_DROPPED, "stream" => stream.to_string())
            .increment(result.dropped as u64);
    }
    if !result.overflowed.is_empty() {
        counter!(names::OVERFLOWS_TOTAL, "stream" => stream.to_string())
            .increment(result.overflowed.len() as u64);
    }
}

/// Record a control or application event.
pub fn record_event(kind: &str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind.to_string(), "direction" => direction)
        .increment(1);
}

/// Record how long an item write took.
pub fn record_write(seconds: f64) {
    histogram!(names::WRITE_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Keeps the active connection gauge in step with a client's lifetime.
#[derive(Debug)]
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
