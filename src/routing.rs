//! Shared routing utilities for the Loki and Mimir route tables
//!
//! Single source of truth for required-parameter extraction (query string or
//! form body, with the body preserved for forwarding), request validation,
//! tenant-header injection, and the metric-label path normalization.

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Method, Request, Response};
use axum::response::IntoResponse;
use tracing::debug;

use crate::error::Error;
use crate::proxy::ForwardOptions;
use crate::server::AppState;

/// Multi-tenant scope header injected on forwarded requests.
pub const SCOPE_HEADER: HeaderName = HeaderName::from_static("x-scope-orgid");

/// Upper bound when buffering a form body for validation.
const MAX_FORM_BODY: usize = 10 * 1024 * 1024;

/// Parameters gathered from the URL query and, for form POSTs, the body.
#[derive(Debug, Default)]
pub struct RequestParams {
    pairs: Vec<(String, String)>,
}

impl RequestParams {
    /// First value for a parameter, if present and non-empty.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, v)| k == name && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    /// All values for a parameter.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Extract request parameters from the URL query and, when the request is a
/// form POST, from the body. The body is re-attached unchanged so the
/// downstream backend sees exactly what the client sent.
pub async fn read_params(
    request: Request<Body>,
) -> Result<(Request<Body>, RequestParams), Error> {
    let mut pairs: Vec<(String, String)> = request
        .uri()
        .query()
        .map(parse_form_pairs)
        .unwrap_or_default();

    if !is_form_request(&request) {
        return Ok((request, RequestParams { pairs }));
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_FORM_BODY)
        .await
        .map_err(|_| Error::bad_request("failed to parse form"))?;

    let text = std::str::from_utf8(&bytes).map_err(|_| Error::bad_request("failed to parse form"))?;
    pairs.extend(parse_form_pairs(text));

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok((request, RequestParams { pairs }))
}

fn parse_form_pairs(input: &str) -> Vec<(String, String)> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(input).unwrap_or_default()
}

fn is_form_request(request: &Request<Body>) -> bool {
    if request.method() != Method::POST {
        return false;
    }
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// A required-parameter rule for one endpoint.
#[derive(Debug, Clone, Copy)]
pub enum Requirement<'a> {
    /// A single parameter that must be present and non-empty
    Param(&'static str),
    /// `start` and `end` must both be present
    Range,
    /// At least one value of the (repeatable) parameter must be present
    AtLeastOne(&'static str),
    /// A captured path segment that must be non-empty, described by its
    /// human-readable name (e.g. `"label name"`)
    PathParam(&'static str, &'a str),
}

/// Check every rule, answering with the fixed error message for the first
/// violation.
pub fn validate(params: &RequestParams, requirements: &[Requirement<'_>]) -> Result<(), Error> {
    for requirement in requirements {
        match requirement {
            Requirement::Param(name) => {
                if params.first(name).is_none() {
                    return Err(Error::bad_request(format!(
                        "missing required parameter: {name}"
                    )));
                }
            }
            Requirement::Range => {
                if params.first("start").is_none() || params.first("end").is_none() {
                    return Err(Error::bad_request(
                        "missing required parameters: start and end",
                    ));
                }
            }
            Requirement::AtLeastOne(name) => {
                if params.all(name).is_empty() {
                    return Err(Error::bad_request(format!(
                        "missing required parameter: {name}"
                    )));
                }
            }
            Requirement::PathParam(name, value) => {
                if value.is_empty() {
                    return Err(Error::bad_request(format!("missing {name}")));
                }
            }
        }
    }
    Ok(())
}

/// Validate an inbound request for one backend, attach the tenant scope
/// header, and forward it through the cluster's service-proxy client.
///
/// Validation precedes the tenant-header build and the forward call. With an
/// empty requirement list the body is never buffered, keeping the generic
/// forwarding path fully streamed.
pub(crate) async fn dispatch(
    state: AppState,
    backend: &'static str,
    cluster: String,
    request: Request<Body>,
    requirements: &[Requirement<'_>],
) -> Response<Body> {
    let Some(client) = state.backend_client(backend, &cluster) else {
        return Error::not_found(format!(
            "cluster not found or {backend} not configured"
        ))
        .into_response();
    };

    let request = if requirements.is_empty() {
        request
    } else {
        let (request, params) = match read_params(request).await {
            Ok(extracted) => extracted,
            Err(e) => return e.into_response(),
        };
        if let Err(e) = validate(&params, requirements) {
            return e.into_response();
        }
        request
    };

    let mut opts = ForwardOptions::default();
    let scope = state
        .tenants
        .scope_header(&cluster, state.max_tenant_header_length);
    if !scope.is_empty() {
        match HeaderValue::from_str(&scope) {
            Ok(value) => {
                opts.additional_headers.insert(SCOPE_HEADER, value);
            }
            Err(_) => {
                debug!(cluster = %cluster, "scope header not representable, omitting");
            }
        }
    }

    let strip_prefix = format!("/clusters/{cluster}/{backend}");
    client.forward(request, &strip_prefix, opts).await
}

/// Normalize a path for metric labels: dynamic segments are replaced with
/// their placeholders so label cardinality stays bounded.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    let mut normalized: Vec<String> = Vec::with_capacity(parts.len());

    for (i, part) in parts.iter().enumerate() {
        let replaced = if i > 0 && parts[i - 1] == "clusters" && !part.is_empty() {
            "{cluster}"
        } else if i > 0
            && parts[i - 1] == "label"
            && !part.is_empty()
            && parts.get(i + 1).copied() == Some("values")
        {
            "{name}"
        } else {
            part
        };
        normalized.push(replaced.to_string());
    }

    normalized.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Parameter Extraction Tests
    // =========================================================================

    #[tokio::test]
    async fn params_from_query_string() {
        let request = Request::builder()
            .method("GET")
            .uri("/x?query=up&start=1&match%5B%5D=a&match%5B%5D=b")
            .body(Body::empty())
            .unwrap();

        let (_request, params) = read_params(request).await.unwrap();
        assert_eq!(params.first("query"), Some("up"));
        assert_eq!(params.first("start"), Some("1"));
        assert_eq!(params.all("match[]"), vec!["a", "b"]);
        assert_eq!(params.first("end"), None);
    }

    #[tokio::test]
    async fn params_from_form_body_preserve_the_body() {
        let form = "query=%7Bjob%3D%22app%22%7D&limit=100";
        let request = Request::builder()
            .method("POST")
            .uri("/x")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();

        let (request, params) = read_params(request).await.unwrap();
        assert_eq!(params.first("query"), Some(r#"{job="app"}"#));
        assert_eq!(params.first("limit"), Some("100"));

        let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], form.as_bytes());
    }

    #[tokio::test]
    async fn query_and_form_values_are_merged() {
        let request = Request::builder()
            .method("POST")
            .uri("/x?start=1")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("end=2"))
            .unwrap();

        let (_request, params) = read_params(request).await.unwrap();
        assert_eq!(params.first("start"), Some("1"));
        assert_eq!(params.first("end"), Some("2"));
    }

    #[tokio::test]
    async fn non_form_post_body_is_not_parsed() {
        let request = Request::builder()
            .method("POST")
            .uri("/x")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"query":"up"}"#))
            .unwrap();

        let (request, params) = read_params(request).await.unwrap();
        assert_eq!(params.first("query"), None);

        let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"query":"up"}"#);
    }

    #[tokio::test]
    async fn empty_parameter_value_counts_as_missing() {
        let request = Request::builder()
            .method("GET")
            .uri("/x?query=")
            .body(Body::empty())
            .unwrap();

        let (_request, params) = read_params(request).await.unwrap();
        assert_eq!(params.first("query"), None);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    fn params_of(pairs: &[(&str, &str)]) -> RequestParams {
        RequestParams {
            pairs: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn validate_reports_missing_parameter_by_name() {
        let err = validate(&params_of(&[]), &[Requirement::Param("query")]).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: query");
    }

    #[test]
    fn validate_reports_missing_range_as_pair() {
        let params = params_of(&[("query", "up"), ("start", "1")]);
        let err = validate(
            &params,
            &[Requirement::Param("query"), Requirement::Range],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "missing required parameters: start and end");
    }

    #[test]
    fn validate_checks_query_before_range() {
        let params = params_of(&[("start", "1"), ("end", "2")]);
        let err = validate(
            &params,
            &[Requirement::Param("query"), Requirement::Range],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: query");
    }

    #[test]
    fn validate_requires_at_least_one_match() {
        let err = validate(&params_of(&[]), &[Requirement::AtLeastOne("match[]")]).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: match[]");

        let params = params_of(&[("match[]", "{job=\"a\"}")]);
        assert!(validate(&params, &[Requirement::AtLeastOne("match[]")]).is_ok());
    }

    #[test]
    fn validate_rejects_empty_path_segment() {
        let err = validate(&params_of(&[]), &[Requirement::PathParam("label name", "")])
            .unwrap_err();
        assert_eq!(err.to_string(), "missing label name");

        assert!(validate(
            &params_of(&[]),
            &[Requirement::PathParam("label name", "job")],
        )
        .is_ok());
    }

    #[test]
    fn validate_accepts_complete_requests() {
        let params = params_of(&[("query", "up"), ("start", "1"), ("end", "2")]);
        assert!(validate(
            &params,
            &[Requirement::Param("query"), Requirement::Range],
        )
        .is_ok());
    }

    // =========================================================================
    // Path Normalization Tests
    // =========================================================================

    #[test]
    fn normalize_replaces_cluster_segment() {
        assert_eq!(
            normalize_path("/clusters/eu-prod/logs/api/v1/query"),
            "/clusters/{cluster}/logs/api/v1/query"
        );
    }

    #[test]
    fn normalize_replaces_label_name_segment() {
        assert_eq!(
            normalize_path("/clusters/eu/metrics/api/v1/label/job/values"),
            "/clusters/{cluster}/metrics/api/v1/label/{name}/values"
        );
    }

    #[test]
    fn normalize_leaves_static_paths_alone() {
        assert_eq!(normalize_path("/healthz"), "/healthz");
        assert_eq!(normalize_path("/api/v1/clusters"), "/api/v1/clusters");
    }
}
