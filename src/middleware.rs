//! HTTP middleware: request metrics, logging, panic recovery, bearer auth
//!
//! Ordering (outermost first) is metrics, logging, recovery, then the
//! optional bearer check, so every request is measured and logged even when a
//! handler panics or fails authentication.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use subtle::ConstantTimeEq;
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::metrics;
use crate::routing::normalize_path;
use crate::server::AppState;

/// Paths that never require authentication and only log at trace level.
const MANAGEMENT_PATHS: &[&str] = &["/healthz", "/readyz", "/metrics"];

/// Record request counts, durations, and the in-flight gauge. Path labels are
/// normalized so dynamic segments stay cardinality-bounded.
pub async fn record_metrics(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());

    let _in_flight = metrics::in_flight_guard();
    let start = Instant::now();
    let response = next.run(request).await;

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}

/// Log one line per request, at a level matching its outcome.
pub async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if is_management_path(&path) {
        trace!(%method, %path, status, duration_ms, %user_agent, "http request");
    } else if status >= 500 {
        error!(%method, %path, status, duration_ms, %user_agent, "http request");
    } else if status >= 400 {
        warn!(%method, %path, status, duration_ms, %user_agent, "http request");
    } else {
        debug!(%method, %path, status, duration_ms, %user_agent, "http request");
    }

    response
}

/// Convert handler panics into a 500 response instead of tearing down the
/// connection, logging the panic with method and path.
pub async fn recover_panics(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    match std::panic::AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(
                %method,
                %path,
                panic = panic_message(&panic),
                "recovered from panic"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": "internal server error" })),
            )
                .into_response()
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Validate the inbound bearer token when auth is enabled. Management paths
/// are exempt so probes and scrapes keep working with rotated tokens.
pub async fn bearer_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let auth = &state.config.auth;
    if !auth.enabled || is_management_path(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        debug!(path = %request.uri().path(), "missing or malformed authorization header");
        return Error::Unauthorized.into_response();
    };

    let valid = auth
        .bearer_tokens
        .iter()
        .any(|candidate| bool::from(token.as_bytes().ct_eq(candidate.as_bytes())));
    if !valid {
        debug!(path = %request.uri().path(), "invalid bearer token");
        return Error::Unauthorized.into_response();
    }

    next.run(request).await
}

fn is_management_path(path: &str) -> bool {
    MANAGEMENT_PATHS
        .iter()
        .any(|skip| path == *skip || path.starts_with(&format!("{skip}/")))
}
