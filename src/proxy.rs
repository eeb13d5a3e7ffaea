//! Service-proxy tunnel client
//!
//! Translates an inbound HTTP request into the equivalent call against the
//! remote Kubernetes API server's service-proxy subresource:
//!
//! ```text
//! /api/v1/namespaces/{ns}/services/{svc}:{port}/proxy{path}?{query}
//! ```
//!
//! This module is the single source of truth for that URL shape; every router
//! goes through [`ServiceProxyClient::forward`]. The transport itself sits
//! behind the [`Tunnel`] trait so request translation can be tested without a
//! cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use http_body::Body as _;
use tracing::{debug, error};

use crate::cluster::Connector;
use crate::error::Error;
use crate::metrics;

/// Hop-by-hop headers never forwarded upstream. `Accept-Encoding` is
/// suppressed too so the backend does not respond with a compressed body the
/// proxy would have to re-handle.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "accept-encoding",
    // Transport-managed; the tunnel client derives these from the outbound
    // request itself.
    "host",
    "content-length",
];

/// Response headers owned by the transport rather than the backend.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length"];

/// A request prepared for the tunnel transport.
pub struct TunnelRequest {
    /// HTTP method
    pub method: Method,
    /// Path and query on the API server, starting with `/api/v1/namespaces/`
    pub path_and_query: String,
    /// Already-filtered header set
    pub headers: HeaderMap,
    /// Streaming request body, when the inbound request carried one
    pub body: Option<reqwest::Body>,
    /// Per-request deadline
    pub timeout: Duration,
}

/// Raw response from the tunnel.
pub struct TunnelResponse {
    /// HTTP status reported by the upstream; 0 means unknown
    pub status: u16,
    /// Response headers observed from the upstream
    pub headers: HeaderMap,
    /// Raw response body bytes
    pub body: Bytes,
}

/// Transport executing service-proxy calls against one cluster's API server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Execute the request and return the raw response.
    async fn execute(&self, request: TunnelRequest) -> Result<TunnelResponse, Error>;
}

#[async_trait]
impl Tunnel for Connector {
    async fn execute(&self, request: TunnelRequest) -> Result<TunnelResponse, Error> {
        let url = format!("{}{}", self.base_url(), request.path_and_query);

        let mut builder = self
            .http()
            .request(request.method, &url)
            .timeout(request.timeout)
            .headers(request.headers);

        if let Some(token) = self.bearer_token().await? {
            builder = builder.bearer_auth(token);
        } else if let Some((username, password)) = self.basic_auth() {
            builder = builder.basic_auth(username, Some(password));
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TunnelResponse {
            status,
            headers,
            body,
        })
    }
}

/// Extra forwarding inputs supplied by the routers.
#[derive(Default)]
pub struct ForwardOptions {
    /// Headers added (not replaced) on top of the forwarded set
    pub additional_headers: HeaderMap,
}

/// Forwarder for one backend service in one cluster.
pub struct ServiceProxyClient {
    tunnel: Arc<dyn Tunnel>,
    cluster: String,
    backend: &'static str,
    namespace: String,
    service: String,
    port: i32,
    path_prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for ServiceProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxyClient")
            .field("cluster", &self.cluster)
            .field("backend", &self.backend)
            .field("namespace", &self.namespace)
            .field("service", &self.service)
            .field("port", &self.port)
            .field("path_prefix", &self.path_prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceProxyClient {
    /// Create a forwarder aimed at `{namespace}/{service}:{port}` in the
    /// given cluster. A zero timeout selects the 30 s default.
    pub fn new(
        tunnel: Arc<dyn Tunnel>,
        cluster: impl Into<String>,
        backend: &'static str,
        namespace: impl Into<String>,
        service: impl Into<String>,
        port: i32,
        path_prefix: Option<&str>,
        timeout: Duration,
    ) -> Result<ServiceProxyClient, Error> {
        let namespace = namespace.into();
        let service = service.into();

        if namespace.is_empty() {
            return Err(Error::config("namespace is required"));
        }
        if service.is_empty() {
            return Err(Error::config("service is required"));
        }
        if port <= 0 {
            return Err(Error::config("port must be positive"));
        }

        let timeout = if timeout.is_zero() {
            Duration::from_secs(crate::DEFAULT_QUERY_TIMEOUT_SECS)
        } else {
            timeout
        };

        Ok(ServiceProxyClient {
            tunnel,
            cluster: cluster.into(),
            backend,
            namespace,
            service,
            port,
            path_prefix: path_prefix.unwrap_or_default().to_string(),
            timeout,
        })
    }

    /// The service-proxy path on the API server for an upstream path.
    pub fn proxy_path(&self, upstream: &str) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy{}",
            self.namespace, self.service, self.port, upstream
        )
    }

    /// The upstream path for an inbound path: strip the route prefix,
    /// substitute `/` when nothing remains, then inject the configured
    /// service path prefix.
    fn upstream_path(&self, inbound_path: &str, strip_prefix: &str) -> String {
        let tail = inbound_path.strip_prefix(strip_prefix).unwrap_or(inbound_path);
        let tail = if tail.is_empty() { "/" } else { tail };
        format!("{}{}", self.path_prefix, tail)
    }

    /// Forward the inbound request through the service proxy and render the
    /// upstream's answer. Transport failures become a synthetic 502; upstream
    /// HTTP errors pass through verbatim.
    pub async fn forward(
        &self,
        request: Request<Body>,
        strip_prefix: &str,
        opts: ForwardOptions,
    ) -> Response<Body> {
        let method = request.method().clone();
        let uri = request.uri().clone();

        let upstream = self.upstream_path(uri.path(), strip_prefix);
        let mut path_and_query = self.proxy_path(&upstream);
        if let Some(query) = uri.query() {
            if !query.is_empty() {
                path_and_query.push('?');
                path_and_query.push_str(query);
            }
        }

        let mut headers = filter_request_headers(request.headers());
        for (name, value) in opts.additional_headers.iter() {
            headers.append(name, value.clone());
        }

        debug!(
            cluster = %self.cluster,
            backend = self.backend,
            namespace = %self.namespace,
            service = %self.service,
            port = self.port,
            method = %method,
            path = %uri.path(),
            proxy_path = %path_and_query,
            "proxying request"
        );

        let body = request.into_body();
        let body = if body.size_hint().upper() == Some(0) {
            None
        } else {
            Some(reqwest::Body::wrap_stream(body.into_data_stream()))
        };

        let started = Instant::now();
        let outcome = self
            .tunnel
            .execute(TunnelRequest {
                method,
                path_and_query,
                headers,
                body,
                timeout: self.timeout,
            })
            .await;

        match outcome {
            Ok(response) => {
                metrics::record_proxy_request(
                    &self.cluster,
                    self.backend,
                    response.status,
                    started.elapsed(),
                );
                render_upstream_response(response)
            }
            Err(e) => {
                error!(
                    cluster = %self.cluster,
                    backend = self.backend,
                    service = %self.service,
                    error = %e,
                    "proxy request failed"
                );
                metrics::record_proxy_request(
                    &self.cluster,
                    self.backend,
                    StatusCode::BAD_GATEWAY.as_u16(),
                    started.elapsed(),
                );
                render_transport_error(&e)
            }
        }
    }
}

/// Copy inbound request headers, dropping the hop-by-hop set.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Write the upstream response back: observed headers, defaulted
/// `Content-Type`, original status (0 becomes 200), raw body verbatim.
fn render_upstream_response(upstream: TunnelResponse) -> Response<Body> {
    let status = match upstream.status {
        0 => StatusCode::OK,
        code => StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
    };

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers.iter() {
            if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
    }

    builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn plain_status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Synthesize the 502 answer for transport-level failures.
fn render_transport_error(error: &Error) -> Response<Body> {
    let message = match error {
        Error::Proxy(_) => error.to_string(),
        other => format!("proxy request failed: {other}"),
    };
    let body = serde_json::json!({ "error": message }).to_string();

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body))
        .unwrap_or_else(|_| plain_status(StatusCode::BAD_GATEWAY))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// One translated request as observed by the stub tunnel.
    pub(crate) struct RecordedRequest {
        pub(crate) method: Method,
        pub(crate) path_and_query: String,
        pub(crate) headers: HeaderMap,
        pub(crate) body: Option<Bytes>,
    }

    /// Tunnel that records translated requests and answers with a canned
    /// response.
    pub(crate) struct RecordingTunnel {
        pub(crate) seen: Mutex<Vec<RecordedRequest>>,
        pub(crate) response: fn() -> Result<TunnelResponse, Error>,
    }

    impl RecordingTunnel {
        pub(crate) fn ok() -> Arc<Self> {
            Arc::new(RecordingTunnel {
                seen: Mutex::new(Vec::new()),
                response: || {
                    Ok(TunnelResponse {
                        status: 200,
                        headers: HeaderMap::new(),
                        body: Bytes::from_static(b"{}"),
                    })
                },
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(RecordingTunnel {
                seen: Mutex::new(Vec::new()),
                response: || Err(Error::proxy("connection reset by peer")),
            })
        }

        pub(crate) fn take(&self) -> Vec<RecordedRequest> {
            std::mem::take(&mut self.seen.lock().unwrap())
        }
    }

    #[async_trait]
    impl Tunnel for RecordingTunnel {
        async fn execute(&self, request: TunnelRequest) -> Result<TunnelResponse, Error> {
            use http_body_util::BodyExt;
            let body = match request.body {
                Some(body) => Some(
                    body.collect()
                        .await
                        .map(|collected| collected.to_bytes())
                        .unwrap_or_default(),
                ),
                None => None,
            };
            self.seen.lock().unwrap().push(RecordedRequest {
                method: request.method,
                path_and_query: request.path_and_query,
                headers: request.headers,
                body,
            });
            (self.response)()
        }
    }
}
