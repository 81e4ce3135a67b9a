//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sidecar_watch_errors_total` (counter): failed control-plane queries by track
//! - `sidecar_snapshots_total` (counter): snapshots emitted by the watcher
//! - `sidecar_reconcile_total` (counter): reconciliation passes by result
//! - `sidecar_dataplane_version` (gauge): store version after the last commit
//! - `sidecar_upstreams` (gauge): upstreams in the last applied snapshot
//!
//! Recording is a no-op until a recorder is installed, so the helpers are
//! safe to call from tests.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_watch_error(track: &'static str) {
    ::metrics::counter!("sidecar_watch_errors_total", "track" => track).increment(1);
}

pub fn record_snapshot() {
    ::metrics::counter!("sidecar_snapshots_total").increment(1);
}

pub fn record_reconcile(result: &'static str) {
    ::metrics::counter!("sidecar_reconcile_total", "result" => result).increment(1);
}

pub fn record_dataplane_version(version: u64) {
    ::metrics::gauge!("sidecar_dataplane_version").set(version as f64);
}

pub fn record_upstreams(count: usize) {
    ::metrics::gauge!("sidecar_upstreams").set(count as f64);
}
