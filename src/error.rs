//! Error types for the federation proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Cluster connector construction error, fatal at startup
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Bearer token mint error for a managed-cloud cluster
    #[error("token error: {0}")]
    Token(String),

    /// Upstream transport error while tunneling a request
    #[error("proxy request failed: {0}")]
    Proxy(String),

    /// Request validation error naming the offending parameter
    #[error("{0}")]
    BadRequest(String),

    /// Unknown cluster or unconfigured backend
    #[error("{0}")]
    NotFound(String),

    /// Inbound request failed bearer authentication
    #[error("unauthorized")]
    Unauthorized,

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a token mint error with the given message
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }

    /// Create an upstream proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create a validation error with the given message
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Proxy(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Proxy(_) | Error::Token(_) | Error::Kube(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Cluster(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
