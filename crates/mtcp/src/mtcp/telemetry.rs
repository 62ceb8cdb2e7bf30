use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Counts a classified connection for as long as it is alive.
pub struct ActiveConnGuard {
    role: &'static str,
}

impl ActiveConnGuard {
    pub fn new(role: &'static str) -> Self {
        metrics::counter!("mtcp_connections_total", "role" => role).increment(1);
        metrics::gauge!("mtcp_active_connections", "role" => role).increment(1.0);
        Self { role }
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("mtcp_active_connections", "role" => self.role).decrement(1.0);
    }
}

pub fn record_bytes(direction: &'static str, n: usize) {
    metrics::counter!("mtcp_bytes_total", "direction" => direction).increment(n as u64);
}
