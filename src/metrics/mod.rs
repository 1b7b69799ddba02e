use anyhow::Result;
use log::info;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, time::Duration};

// Metrics for monitoring
pub const METRIC_REQUESTS: &str = "holders_requests_total";
pub const METRIC_CACHE_HITS: &str = "holders_cache_hits_total";
pub const METRIC_CACHE_MISSES: &str = "holders_cache_misses_total";
pub const METRIC_BALANCE_FAILURES: &str = "holders_balance_failures_total";
pub const METRIC_PRICE_FALLBACKS: &str = "holders_price_fallbacks_total";
pub const METRIC_KV_FALLBACKS: &str = "holders_kv_fallbacks_total";
pub const METRIC_COMPUTE_TIME: &str = "holders_compute_seconds";

/// Installs the Prometheus exporter with its own HTTP listener.
pub fn install_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

pub fn record_request() {
    counter!(METRIC_REQUESTS, 1);
}

pub fn record_cache_hit() {
    counter!(METRIC_CACHE_HITS, 1);
}

pub fn record_cache_miss() {
    counter!(METRIC_CACHE_MISSES, 1);
}

pub fn record_balance_failures(count: usize) {
    if count > 0 {
        counter!(METRIC_BALANCE_FAILURES, count as u64);
    }
}

pub fn record_price_fallback(stage: &'static str) {
    counter!(METRIC_PRICE_FALLBACKS, 1, "stage" => stage);
}

pub fn record_kv_fallback(op: &'static str) {
    counter!(METRIC_KV_FALLBACKS, 1, "op" => op);
}

pub fn record_compute_time(duration: Duration) {
    histogram!(METRIC_COMPUTE_TIME, duration.as_secs_f64());
}
