//! Prometheus metrics for the federation proxy
//!
//! Installs a process-wide Prometheus recorder and exposes helpers for the
//! metric families recorded across the proxy. The scrape endpoint renders the
//! shared handle, so handlers never juggle recorder state.

use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::Error;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder and describe the metric families.
///
/// Idempotent within a process only in the sense that a second call returns an
/// error; callers install once at startup.
pub fn install() -> Result<(), Error> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("failed to install Prometheus recorder: {e}")))?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| Error::internal("Prometheus recorder already installed"))?;

    metrics::describe_counter!(
        "http_requests_total",
        "Total number of HTTP requests by method, path, and status"
    );
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    metrics::describe_gauge!(
        "http_requests_in_flight",
        "Number of HTTP requests currently being processed"
    );
    metrics::describe_counter!(
        "proxy_requests_total",
        "Total number of proxy requests to backend clusters"
    );
    metrics::describe_histogram!(
        "proxy_request_duration_seconds",
        "Proxy request duration to backend clusters in seconds"
    );
    metrics::describe_gauge!(
        "cluster_health_status",
        "Cluster health status (1 = healthy, 0 = unhealthy)"
    );
    metrics::describe_gauge!("tenant_count", "Number of discovered tenants per cluster");
    metrics::describe_gauge!("cluster_info", "Cluster configuration information");

    Ok(())
}

/// Render the metrics in the Prometheus text exposition format.
pub fn scrape() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record one served HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_owned(),
        "path" => path.to_owned(),
        "status" => status.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_owned(),
        "path" => path.to_owned(),
    )
    .record(duration.as_secs_f64());
}

/// Track an in-flight request for the duration of the returned guard.
pub fn in_flight_guard() -> InFlightGuard {
    metrics::gauge!("http_requests_in_flight").increment(1.0);
    InFlightGuard
}

/// Guard decrementing the in-flight gauge on drop.
pub struct InFlightGuard;

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        metrics::gauge!("http_requests_in_flight").decrement(1.0);
    }
}

/// Record one tunneled request to a backend cluster.
pub fn record_proxy_request(cluster: &str, backend: &str, status: u16, duration: Duration) {
    metrics::counter!(
        "proxy_requests_total",
        "cluster" => cluster.to_owned(),
        "backend" => backend.to_owned(),
        "status" => status.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "proxy_request_duration_seconds",
        "cluster" => cluster.to_owned(),
        "backend" => backend.to_owned(),
    )
    .record(duration.as_secs_f64());
}

/// Record the health probe outcome for a cluster.
pub fn record_cluster_health(cluster: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    metrics::gauge!("cluster_health_status", "cluster" => cluster.to_owned()).set(value);
}

/// Record the number of discovered tenants for a cluster.
pub fn record_tenant_count(cluster: &str, count: usize) {
    metrics::gauge!("tenant_count", "cluster" => cluster.to_owned()).set(count as f64);
}

/// Record static cluster configuration info.
pub fn record_cluster_info(cluster: &str, cluster_type: &str, has_logs: bool, has_metrics: bool) {
    metrics::gauge!(
        "cluster_info",
        "cluster" => cluster.to_owned(),
        "type" => cluster_type.to_owned(),
        "has_logs" => has_logs.to_string(),
        "has_metrics" => has_metrics.to_string(),
    )
    .set(1.0);
}
