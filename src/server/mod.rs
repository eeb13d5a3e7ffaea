//! HTTP front: router assembly, management endpoints, graceful shutdown
//!
//! Composes the Loki and Mimir route tables with the management surface
//! (`/healthz`, `/readyz`, cluster inventory, optional `/metrics`), wires the
//! middleware chain, and runs the listener until a shutdown signal arrives.
//! Shutdown stops the tenant watchers first, then drains in-flight requests
//! under a bounded deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::ClusterRegistry;
use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::proxy::ServiceProxyClient;
use crate::tenant::TenantRegistry;
use crate::{loki, middleware, mimir};

/// How long in-flight requests may drain after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Cluster connectors, absent when no clusters are configured
    pub clusters: Option<Arc<ClusterRegistry>>,
    /// Tenant watchers
    pub tenants: Arc<TenantRegistry>,
    /// Per-cluster Loki forwarders
    pub logs_clients: Arc<HashMap<String, Arc<ServiceProxyClient>>>,
    /// Per-cluster Mimir forwarders
    pub metrics_clients: Arc<HashMap<String, Arc<ServiceProxyClient>>>,
    /// Byte cap for the scope header
    pub max_tenant_header_length: usize,
}

impl AppState {
    /// Assemble the state: build one service-proxy client per configured
    /// backend endpoint and record the static cluster-info metrics.
    pub fn new(
        config: Arc<Config>,
        clusters: Option<Arc<ClusterRegistry>>,
        tenants: Arc<TenantRegistry>,
    ) -> AppState {
        let mut logs_clients = HashMap::new();
        let mut metrics_clients = HashMap::new();

        for cluster_cfg in &config.clusters {
            metrics::record_cluster_info(
                &cluster_cfg.name,
                cluster_cfg.cluster_type.as_str(),
                cluster_cfg.logs.is_some(),
                cluster_cfg.metrics.is_some(),
            );
        }

        if let Some(registry) = &clusters {
            for cluster_cfg in &config.clusters {
                let Some(connector) = registry.get(&cluster_cfg.name) else {
                    warn!(cluster = %cluster_cfg.name, "cluster not found in registry");
                    continue;
                };

                for (backend, endpoint, clients) in [
                    ("logs", &cluster_cfg.logs, &mut logs_clients),
                    ("metrics", &cluster_cfg.metrics, &mut metrics_clients),
                ] {
                    let Some(endpoint) = endpoint else { continue };
                    match ServiceProxyClient::new(
                        connector.clone(),
                        &cluster_cfg.name,
                        backend,
                        &endpoint.namespace,
                        &endpoint.service,
                        endpoint.port,
                        endpoint.path_prefix.as_deref(),
                        config.proxy.query_timeout(),
                    ) {
                        Ok(client) => {
                            info!(
                                cluster = %cluster_cfg.name,
                                backend,
                                "created service-proxy client"
                            );
                            clients.insert(cluster_cfg.name.clone(), Arc::new(client));
                        }
                        Err(e) => {
                            error!(
                                cluster = %cluster_cfg.name,
                                backend,
                                error = %e,
                                "failed to create service-proxy client"
                            );
                        }
                    }
                }
            }
        }

        AppState {
            max_tenant_header_length: config.proxy.max_tenant_header_length,
            config,
            clusters,
            tenants,
            logs_clients: Arc::new(logs_clients),
            metrics_clients: Arc::new(metrics_clients),
        }
    }

    pub(crate) fn backend_client(
        &self,
        backend: &str,
        cluster: &str,
    ) -> Option<Arc<ServiceProxyClient>> {
        match backend {
            "logs" => self.logs_clients.get(cluster).cloned(),
            "metrics" => self.metrics_clients.get(cluster).cloned(),
            _ => None,
        }
    }
}

/// Build the complete router: management endpoints, backend route tables,
/// and the middleware chain (metrics, logging, recovery, optional auth, from
/// outermost in).
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/readyz", get(handle_readyz))
        .route("/api/v1/clusters", get(handle_list_clusters))
        .route("/api/v1/clusters/{cluster}/tenants", get(handle_list_tenants));

    if state.config.proxy.metrics_enabled {
        router = router.route("/metrics", get(handle_metrics));
    }

    router = loki::register_routes(router);
    router = mimir::register_routes(router);

    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::bearer_auth,
        ))
        .layer(axum::middleware::from_fn(middleware::recover_panics))
        .layer(axum::middleware::from_fn(middleware::log_requests))
        .layer(axum::middleware::from_fn(middleware::record_metrics))
        .with_state(state)
}

/// Serve until the shutdown future resolves, then stop the tenant watchers
/// and drain connections under the grace deadline.
pub async fn run(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    let addr = normalize_listen_address(&state.config.proxy.listen_address);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))?;

    info!(addr = %addr, "starting HTTP server");

    let cancel = CancellationToken::new();
    let drain = cancel.clone();
    let tenants = state.tenants.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("shutting down server");
        // Watchers go first so their event handlers cannot outlive the
        // server's exit.
        tenants.stop();
        drain.cancel();
    });

    let router = build_router(state);
    let deadline = cancel.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown({
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    });

    tokio::select! {
        result = server => {
            result.map_err(|e| Error::internal(format!("server error: {e}")))
        }
        _ = async {
            deadline.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "shutdown grace period expired");
            Ok(())
        }
    }
}

/// Resolve until SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "shutdown signal received"),
        _ = terminate => info!(signal = "SIGTERM", "shutdown signal received"),
    }
}

/// Accept Go-style `:8080` bind shorthand alongside full socket addresses.
fn normalize_listen_address(listen: &str) -> String {
    if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    }
}

async fn handle_healthz() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

async fn handle_readyz(State(state): State<AppState>) -> Response {
    let Some(registry) = &state.clusters else {
        return (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response();
    };

    let results = registry.health().await;
    let mut all_healthy = true;
    let mut cluster_status = serde_json::Map::new();

    for (name, outcome) in &results {
        match outcome {
            Ok(()) => {
                cluster_status.insert(name.clone(), "ok".into());
                metrics::record_cluster_health(name, true);
            }
            Err(e) => {
                all_healthy = false;
                cluster_status.insert(name.clone(), e.to_string().into());
                metrics::record_cluster_health(name, false);
            }
        }
    }

    for (cluster, count) in state.tenants.counts() {
        metrics::record_tenant_count(&cluster, count);
    }

    let (status, overall) = if all_healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(serde_json::json!({
            "status": overall,
            "clusters": cluster_status,
        })),
    )
        .into_response()
}

async fn handle_list_clusters(State(state): State<AppState>) -> Response {
    let clusters: Vec<serde_json::Value> = state
        .config
        .clusters
        .iter()
        .map(|c| {
            let mut info = serde_json::json!({
                "name": c.name,
                "type": c.cluster_type.as_str(),
                "has_logs": c.logs.is_some(),
                "has_metrics": c.metrics.is_some(),
            });
            if let Some(watcher) = state.tenants.get(&c.name) {
                info["tenant_count"] = watcher.tenant_count().into();
            }
            info
        })
        .collect();

    Json(serde_json::json!({ "clusters": clusters })).into_response()
}

async fn handle_list_tenants(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
) -> Response {
    let known = match &state.clusters {
        Some(registry) => registry.get(&cluster).is_some(),
        None => state.config.clusters.iter().any(|c| c.name == cluster),
    };
    if !known {
        return Error::not_found("cluster not found").into_response();
    }

    let tenants = state.tenants.tenants(&cluster);
    Json(serde_json::json!({
        "cluster": cluster,
        "tenants": tenants,
    }))
    .into_response()
}

async fn handle_metrics() -> Response {
    match metrics::scrape() {
        Some(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder unavailable",
        )
            .into_response(),
    }
}
