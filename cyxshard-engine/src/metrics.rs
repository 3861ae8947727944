//! Prometheus metrics for the routing engine
//!
//! Recorded through the `metrics` facade; the daemon installs the
//! Prometheus exporter. Without an installed recorder these are no-ops.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter with its own HTTP listener
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a resolve request (`hit`, `miss`, `no_shards`, `error`)
pub fn record_route(result: &'static str) {
    counter!("shard_route_requests_total", "result" => result).increment(1);
}

/// Record current load of a shard
pub fn set_shard_load(shard_id: &str, load_units: u64) {
    gauge!("shard_load_units", "shard" => shard_id.to_string()).set(load_units as f64);
}

/// Record a migration state change (`planned`, `completed`, `retried`, `failed`)
pub fn record_migration(status: &'static str) {
    counter!("shard_migrations_total", "status" => status).increment(1);
}

/// Record a rebalance pass
pub fn record_rebalance_pass() {
    counter!("shard_rebalance_passes_total").increment(1);
}

/// Record a health probe outcome
pub fn record_health_check(healthy: bool) {
    let healthy = if healthy { "true" } else { "false" };
    counter!("shard_health_checks_total", "healthy" => healthy).increment(1);
}
