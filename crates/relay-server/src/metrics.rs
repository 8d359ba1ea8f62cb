//! Metrics export for the Relay server.
//!
//! The hub records through the `metrics` facade; this module describes those
//! metrics and exports them in Prometheus format.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_relay_core::metrics::names;
use tracing::info;

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused at connect time"
    );
    metrics::describe_gauge!(names::STREAMS_ACTIVE, "Number of broadcasting streams");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of stream subscriptions"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of stream subscriptions"
    );
    metrics::describe_counter!(names::ITEMS_PUBLISHED, "Items taken from publishers");
    metrics::describe_counter!(names::ITEMS_DELIVERED, "Items buffered for subscribers");
    metrics::describe_counter!(
        names::ITEMS_DROPPED,
        "Items evicted from full subscriber buffers"
    );
    metrics::describe_counter!(
        names::OVERFLOWS_TOTAL,
        "Subscribers disconnected for falling behind"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Control and application events");
    metrics::describe_histogram!(names::WRITE_SECONDS, "Item write latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
