//! End-to-end routing tests against the assembled router.
//!
//! These drive the full middleware + router + forwarder stack with a stub
//! tunnel transport standing in for the remote API servers, so the complete
//! request flow (validate, build scope header, forward, write response) is
//! exercised without a cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use tower::util::BoxCloneService;
use tower::ServiceExt;

use obs_federation_proxy::config::{
    ClusterConfig, ClusterType, Config, EndpointConfig, KubeconfigConfig, TenantsConfig,
};
use obs_federation_proxy::error::Error;
use obs_federation_proxy::proxy::{
    ServiceProxyClient, Tunnel, TunnelRequest, TunnelResponse,
};
use obs_federation_proxy::server::{build_router, AppState};
use obs_federation_proxy::tenant::{TenantRegistry, TenantWatcher};

/// A kube client that can never reach a cluster; watcher construction only.
fn offline_kube_client() -> kube::Client {
    let service: BoxCloneService<
        http::Request<kube::client::Body>,
        http::Response<kube::client::Body>,
        tower::BoxError,
    > = BoxCloneService::new(tower::service_fn(|_req| async {
        Err::<http::Response<kube::client::Body>, tower::BoxError>("offline".into())
    }));
    kube::Client::new(service, "default")
}

struct Captured {
    path_and_query: String,
    headers: HeaderMap,
}

/// Stub transport recording every translated request.
struct StubTunnel {
    seen: Mutex<Vec<Captured>>,
    fail: bool,
    status: u16,
    body: &'static [u8],
}

impl StubTunnel {
    fn ok() -> Arc<Self> {
        Arc::new(StubTunnel {
            seen: Mutex::new(Vec::new()),
            fail: false,
            status: 200,
            body: br#"{"status":"success"}"#,
        })
    }

    fn with_status(status: u16, body: &'static [u8]) -> Arc<Self> {
        Arc::new(StubTunnel {
            seen: Mutex::new(Vec::new()),
            fail: false,
            status,
            body,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(StubTunnel {
            seen: Mutex::new(Vec::new()),
            fail: true,
            status: 0,
            body: b"",
        })
    }

    fn captured(&self) -> Vec<Captured> {
        std::mem::take(&mut self.seen.lock().unwrap())
    }
}

#[async_trait]
impl Tunnel for StubTunnel {
    async fn execute(&self, request: TunnelRequest) -> Result<TunnelResponse, Error> {
        self.seen.lock().unwrap().push(Captured {
            path_and_query: request.path_and_query,
            headers: request.headers,
        });
        if self.fail {
            return Err(Error::proxy("connect: connection refused"));
        }
        Ok(TunnelResponse {
            status: self.status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(self.body),
        })
    }
}

fn cluster_entry(name: &str) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        cluster_type: ClusterType::StaticConfig,
        eks: None,
        kubeconfig: Some(KubeconfigConfig {
            path: Some("/etc/kubeconfig".into()),
            data: None,
        }),
        logs: Some(EndpointConfig {
            namespace: "loki".into(),
            service: "loki-gateway".into(),
            port: 3100,
            path_prefix: Some("/loki".into()),
        }),
        metrics: Some(EndpointConfig {
            namespace: "mimir".into(),
            service: "mimir-query-frontend".into(),
            port: 8080,
            path_prefix: None,
        }),
        tenants: TenantsConfig::default(),
    }
}

struct Fixture {
    state: AppState,
    logs_tunnel: Arc<StubTunnel>,
    metrics_tunnel: Arc<StubTunnel>,
}

fn fixture(
    cluster: &str,
    namespaces: &[&str],
    tenants_cfg: TenantsConfig,
    max_header_len: usize,
    logs_tunnel: Arc<StubTunnel>,
    metrics_tunnel: Arc<StubTunnel>,
) -> Fixture {
    let watcher =
        Arc::new(TenantWatcher::new(cluster, offline_kube_client(), &tenants_cfg).unwrap());
    watcher.refresh_from_snapshot(namespaces.iter().copied());
    let tenants = Arc::new(TenantRegistry::from_watchers(vec![(
        cluster.to_string(),
        watcher,
    )]));

    let logs_client = ServiceProxyClient::new(
        logs_tunnel.clone(),
        cluster,
        "logs",
        "loki",
        "loki-gateway",
        3100,
        Some("/loki"),
        Duration::from_secs(5),
    )
    .unwrap();
    let metrics_client = ServiceProxyClient::new(
        metrics_tunnel.clone(),
        cluster,
        "metrics",
        "mimir",
        "mimir-query-frontend",
        8080,
        None,
        Duration::from_secs(5),
    )
    .unwrap();

    let mut config = Config::default();
    config.clusters = vec![cluster_entry(cluster)];

    let state = AppState {
        config: Arc::new(config),
        clusters: None,
        tenants,
        logs_clients: Arc::new(HashMap::from([(
            cluster.to_string(),
            Arc::new(logs_client),
        )])),
        metrics_clients: Arc::new(HashMap::from([(
            cluster.to_string(),
            Arc::new(metrics_client),
        )])),
        max_tenant_header_length: max_header_len,
    };

    Fixture {
        state,
        logs_tunnel,
        metrics_tunnel,
    }
}

async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = build_router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn instant_logs_query_forwards_with_single_tenant_scope() {
    let fx = fixture(
        "eu",
        &["kube-system", "game-prod"],
        TenantsConfig {
            include_patterns: vec!["^game-.*".into()],
            exclude_patterns: vec!["^kube-.*".into()],
            refresh_interval_secs: 0,
        },
        8192,
        StubTunnel::ok(),
        StubTunnel::ok(),
    );

    let (status, _body) = send(
        fx.state,
        get("/clusters/eu/logs/api/v1/query?query=%7Bjob%3D%22app%22%7D"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let captured = fx.logs_tunnel.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(
        captured[0].path_and_query,
        "/api/v1/namespaces/loki/services/loki-gateway:3100/proxy/loki/api/v1/query?query=%7Bjob%3D%22app%22%7D"
    );
    assert_eq!(captured[0].headers.get("x-scope-orgid").unwrap(), "game-prod");
}

#[tokio::test]
async fn range_metrics_query_truncates_scope_header_under_cap() {
    let fx = fixture(
        "p",
        &["tenant-a", "tenant-b", "tenant-c"],
        TenantsConfig::default(),
        18,
        StubTunnel::ok(),
        StubTunnel::with_status(200, br#"{"status":"success","data":{}}"#),
    );

    let (status, body) = send(
        fx.state,
        get("/clusters/p/metrics/api/v1/query_range?query=up&start=1609459200&end=1609545600&step=60"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], br#"{"status":"success","data":{}}"#);

    let captured = fx.metrics_tunnel.captured();
    let header = captured[0].headers.get("x-scope-orgid").unwrap();
    assert_eq!(header, "tenant-a|tenant-b");
    assert!(header.len() <= 18);
}

#[tokio::test]
async fn missing_required_parameter_short_circuits_before_upstream() {
    let fx = fixture(
        "p",
        &[],
        TenantsConfig::default(),
        8192,
        StubTunnel::ok(),
        StubTunnel::ok(),
    );

    let (status, body) = send(
        fx.state,
        get("/clusters/p/metrics/api/v1/query_range?start=1&end=2"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "missing required parameter: query");
    assert!(fx.metrics_tunnel.captured().is_empty());
}

#[tokio::test]
async fn unknown_cluster_is_404_with_fixed_message() {
    let fx = fixture(
        "eu",
        &[],
        TenantsConfig::default(),
        8192,
        StubTunnel::ok(),
        StubTunnel::ok(),
    );

    let (status, body) = send(fx.state, get("/clusters/nope/logs/api/v1/labels")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "cluster not found or logs not configured");
}

#[tokio::test]
async fn upstream_transport_error_becomes_502() {
    let fx = fixture(
        "eu",
        &["game-prod"],
        TenantsConfig::default(),
        8192,
        StubTunnel::failing(),
        StubTunnel::ok(),
    );

    let (status, body) = send(
        fx.state,
        get("/clusters/eu/logs/api/v1/query?query=%7Bjob%3D%22app%22%7D"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(
        text.starts_with(r#"{"error":"proxy request failed:"#),
        "unexpected body: {text}"
    );
}

#[tokio::test]
async fn upstream_http_errors_pass_through_verbatim() {
    let fx = fixture(
        "eu",
        &[],
        TenantsConfig::default(),
        8192,
        StubTunnel::with_status(500, b"loki exploded"),
        StubTunnel::ok(),
    );

    let (status, body) = send(fx.state, get("/clusters/eu/logs/api/v1/labels")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&body[..], b"loki exploded");
}

#[tokio::test]
async fn empty_tenant_set_forwards_without_scope_header() {
    let fx = fixture(
        "eu",
        &[],
        TenantsConfig::default(),
        8192,
        StubTunnel::ok(),
        StubTunnel::ok(),
    );

    let (status, _body) = send(fx.state, get("/clusters/eu/logs/api/v1/labels")).await;
    assert_eq!(status, StatusCode::OK);

    let captured = fx.logs_tunnel.captured();
    assert!(!captured[0].headers.contains_key("x-scope-orgid"));
}
