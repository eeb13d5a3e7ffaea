//! Observability federation proxy for multi-cluster Loki and Mimir.
//!
//! The proxy exposes a single Grafana-facing HTTP surface and forwards each
//! query to the Loki or Mimir service running inside the addressed Kubernetes
//! cluster, tunneling through the API server's service-proxy subresource.
//! Along the way it injects an `X-Scope-OrgID` header derived from live
//! namespace discovery in that cluster.
//!
//! # Modules
//!
//! - [`config`] - Configuration document, loading, and validation
//! - [`cluster`] - Per-cluster connectors (EKS and kubeconfig flavors) and the
//!   cluster registry
//! - [`tenant`] - Namespace watchers and the tenant registry
//! - [`proxy`] - Service-proxy tunnel client
//! - [`loki`] - Loki query route table
//! - [`mimir`] - Mimir (Prometheus-compatible) query route table
//! - [`server`] - HTTP front: router assembly, management endpoints, shutdown
//! - [`middleware`] - Request metrics, logging, and bearer authentication
//! - [`metrics`] - Prometheus recorder installation and gauge helpers
//! - [`error`] - Error types shared across the proxy

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod loki;
pub mod metrics;
pub mod middleware;
pub mod mimir;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod tenant;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Product name used as the default AWS role session name and user agent.
pub const PRODUCT_NAME: &str = "obs-federation-proxy";

/// Default per-upstream query deadline in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Default byte cap for the `X-Scope-OrgID` header.
pub const DEFAULT_MAX_TENANT_HEADER_LENGTH: usize = 8192;
