//! Loki query route table
//!
//! Registers the Loki API surface under `/clusters/{cluster}/logs`, validates
//! endpoint-specific required parameters, and delegates to the service-proxy
//! forwarder with the tenant scope header attached.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, Response};
use axum::routing::get;
use axum::Router;

use crate::routing::{dispatch, Requirement};
use crate::server::AppState;

const BACKEND: &str = "logs";

/// Register the Loki routes on the given router.
pub fn register_routes(router: Router<AppState>) -> Router<AppState> {
    router
        .route(
            "/clusters/{cluster}/logs/api/v1/query",
            get(query).post(query),
        )
        .route(
            "/clusters/{cluster}/logs/api/v1/query_range",
            get(query_range).post(query_range),
        )
        .route(
            "/clusters/{cluster}/logs/api/v1/labels",
            get(labels).post(labels),
        )
        .route(
            "/clusters/{cluster}/logs/api/v1/label/{name}/values",
            get(label_values),
        )
        .route(
            "/clusters/{cluster}/logs/api/v1/series",
            get(series).post(series),
        )
        .route(
            "/clusters/{cluster}/logs/api/v1/index/stats",
            get(index_stats).post(index_stats),
        )
        .route("/clusters/{cluster}/logs/api/v1/tail", get(tail))
        .route("/clusters/{cluster}/logs", get(generic).post(generic))
        .route(
            "/clusters/{cluster}/logs/{*path}",
            get(generic).post(generic),
        )
}

/// Instant query; requires `query`.
async fn query(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(
        state,
        BACKEND,
        cluster,
        request,
        &[Requirement::Param("query")],
    )
    .await
}

/// Range query; requires `query`, `start`, and `end`.
async fn query_range(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(
        state,
        BACKEND,
        cluster,
        request,
        &[Requirement::Param("query"), Requirement::Range],
    )
    .await
}

async fn labels(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(state, BACKEND, cluster, request, &[]).await
}

/// Label value lookup; the `{name}` segment must be non-empty.
async fn label_values(
    State(state): State<AppState>,
    Path((cluster, name)): Path<(String, String)>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(
        state,
        BACKEND,
        cluster,
        request,
        &[Requirement::PathParam("label name", &name)],
    )
    .await
}

/// Series lookup; requires at least one `match[]`.
async fn series(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(
        state,
        BACKEND,
        cluster,
        request,
        &[Requirement::AtLeastOne("match[]")],
    )
    .await
}

async fn index_stats(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(state, BACKEND, cluster, request, &[]).await
}

/// Live tail; forwarded as a single HTTP request, not upgraded to a
/// WebSocket stream.
async fn tail(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(
        state,
        BACKEND,
        cluster,
        request,
        &[Requirement::Param("query")],
    )
    .await
}

/// Generic forwarding for unlisted paths under the prefix.
async fn generic(
    State(state): State<AppState>,
    Path(params): Path<std::collections::HashMap<String, String>>,
    request: Request<Body>,
) -> Response<Body> {
    let cluster = params.get("cluster").cloned().unwrap_or_default();
    dispatch(state, BACKEND, cluster, request, &[]).await
}
