//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method and status
//! - `proxy_response_header_seconds` (histogram): time until headers are committed
//! - `proxy_backend_dial_failures_total` (counter)
//! - `proxy_upgrades_total` (counter): connections handed to the duplex pipe
//! - `proxy_active_pipes` (gauge): duplex pipes currently relaying
//!
//! Recording is a no-op until [`init_metrics`] installs an exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a request whose status has been decided.
pub fn record_request(method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_response_header_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_dial_failure() {
    metrics::counter!("proxy_backend_dial_failures_total").increment(1);
}

/// Mark a duplex pipe as started; pair with [`pipe_closed`].
pub fn pipe_opened() {
    metrics::counter!("proxy_upgrades_total").increment(1);
    metrics::gauge!("proxy_active_pipes").increment(1.0);
}

pub fn pipe_closed() {
    metrics::gauge!("proxy_active_pipes").decrement(1.0);
}
