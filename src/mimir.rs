//! Mimir (Prometheus-compatible) query route table
//!
//! Same shape as the Loki table under `/clusters/{cluster}/metrics`, with the
//! Prometheus endpoint set: instant and range queries, labels, series,
//! metadata, exemplars, and remote read.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::routing::{dispatch, Requirement};
use crate::server::AppState;

const BACKEND: &str = "metrics";

/// Register the Mimir routes on the given router.
pub fn register_routes(router: Router<AppState>) -> Router<AppState> {
    router
        .route(
            "/clusters/{cluster}/metrics/api/v1/query",
            get(query).post(query),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/query_range",
            get(query_range).post(query_range),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/labels",
            get(labels).post(labels),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/label/{name}/values",
            get(label_values),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/series",
            get(series).post(series),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/metadata",
            get(metadata),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/query_exemplars",
            get(query_exemplars).post(query_exemplars),
        )
        .route(
            "/clusters/{cluster}/metrics/api/v1/read",
            post(remote_read),
        )
        .route("/clusters/{cluster}/metrics", get(generic).post(generic))
        .route(
            "/clusters/{cluster}/metrics/{*path}",
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

async fn metadata(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(state, BACKEND, cluster, request, &[]).await
}

/// Exemplar query; requires `query`.
async fn query_exemplars(
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

/// Prometheus remote read; the protobuf body is forwarded untouched.
async fn remote_read(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    dispatch(state, BACKEND, cluster, request, &[]).await
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
