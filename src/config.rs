//! Configuration document, loading, and validation
//!
//! The proxy is configured from a single YAML document plus `OFP_`-prefixed
//! environment overrides. Validation is explicit and reports the offending
//! field path, so misconfigurations fail at startup rather than at request
//! time.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::{DEFAULT_MAX_TENANT_HEADER_LENGTH, DEFAULT_QUERY_TIMEOUT_SECS};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server and proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Inbound bearer authentication settings
    #[serde(default)]
    pub auth: AuthConfig,
    /// Log sink settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Clusters to federate queries across
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// HTTP server and proxy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// HTTP bind address, e.g. `:8080` or `0.0.0.0:8080`
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Per-upstream query deadline in seconds
    #[serde(rename = "query_timeout", default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Byte cap for the `X-Scope-OrgID` header
    #[serde(default = "default_max_tenant_header_length")]
    pub max_tenant_header_length: usize,
    /// Whether to expose the `/metrics` scrape endpoint
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl ProxyConfig {
    /// Per-upstream query deadline.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            query_timeout_secs: default_query_timeout_secs(),
            max_tenant_header_length: default_max_tenant_header_length(),
            metrics_enabled: true,
        }
    }
}

/// Inbound bearer authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Whether inbound requests must carry a valid bearer token
    #[serde(default)]
    pub enabled: bool,
    /// Accepted bearer tokens; overridable via `AUTH_BEARER_TOKENS`
    #[serde(default)]
    pub bearer_tokens: Vec<String>,
}

/// Log sink settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `json` or `text`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Credential flavor of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ClusterType {
    /// Authentication brokered by AWS via short-lived presigned tokens
    #[serde(rename = "managed-cloud")]
    ManagedCloud,
    /// Authentication from a kubeconfig document supplied out-of-band
    #[serde(rename = "static-config")]
    StaticConfig,
}

impl ClusterType {
    /// The configuration string for this flavor.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::ManagedCloud => "managed-cloud",
            ClusterType::StaticConfig => "static-config",
        }
    }
}

/// A Kubernetes cluster to proxy to.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Stable name, unique across the config; used in URLs
    pub name: String,
    /// Credential flavor
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,
    /// EKS identifiers, required for the managed-cloud flavor
    #[serde(default)]
    pub eks: Option<EksConfig>,
    /// Kubeconfig reference, required for the static-config flavor
    #[serde(default)]
    pub kubeconfig: Option<KubeconfigConfig>,
    /// Loki endpoint inside the cluster
    #[serde(default)]
    pub logs: Option<EndpointConfig>,
    /// Mimir endpoint inside the cluster
    #[serde(default)]
    pub metrics: Option<EndpointConfig>,
    /// Tenant discovery settings
    #[serde(default)]
    pub tenants: TenantsConfig,
}

/// AWS EKS cluster identifiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EksConfig {
    /// EKS cluster handle as known to the AWS control plane
    pub cluster_name: String,
    /// AWS region hosting the cluster
    pub region: String,
    /// Optional IAM role assumption
    #[serde(default)]
    pub assume_role: Option<AssumeRoleConfig>,
}

/// AWS IAM role assumption parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssumeRoleConfig {
    /// ARN of the role to assume
    pub role_arn: String,
    /// Optional external id presented during assumption
    #[serde(default)]
    pub external_id: Option<String>,
    /// Session name; defaults to the product name when unset
    #[serde(default)]
    pub session_name: Option<String>,
}

/// Kubeconfig source: a file path or an inline base64-encoded document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeconfigConfig {
    /// Path to a kubeconfig file
    #[serde(default)]
    pub path: Option<String>,
    /// Inline base64-encoded kubeconfig document
    #[serde(default)]
    pub data: Option<String>,
}

/// An in-cluster service endpoint to tunnel to.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Namespace the service lives in
    pub namespace: String,
    /// Service name
    pub service: String,
    /// Service port
    pub port: i32,
    /// Path prefix the service expects prepended to upstream paths
    #[serde(default)]
    pub path_prefix: Option<String>,
}

/// Tenant discovery settings for one cluster.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantsConfig {
    /// Namespace name patterns to admit; empty admits all
    #[serde(default)]
    pub include_patterns: Vec<String>,
    /// Namespace name patterns to reject
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Resync interval in seconds; 0 means the 60 s default
    #[serde(rename = "refresh_interval", default)]
    pub refresh_interval_secs: u64,
}

impl TenantsConfig {
    /// Resync interval, with 0 mapped to the 60 s default.
    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_secs {
            0 => Duration::from_secs(60),
            secs => Duration::from_secs(secs),
        }
    }
}

fn default_listen_address() -> String {
    ":8080".to_string()
}

fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

fn default_max_tenant_header_length() -> usize {
    DEFAULT_MAX_TENANT_HEADER_LENGTH
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Environment variable overriding `auth.bearer_tokens`, comma-separated.
pub const AUTH_BEARER_TOKENS_ENV: &str = "AUTH_BEARER_TOKENS";

impl Config {
    /// Load configuration from a YAML file plus `OFP_`-prefixed environment
    /// overrides, then validate it.
    pub fn load(path: Option<&str>) -> Result<Config, Error> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(p) => builder.add_source(config::File::with_name(p)),
            None => builder.add_source(config::File::with_name("config").required(false)),
        };

        let raw = builder
            .add_source(config::Environment::with_prefix("OFP").separator("__"))
            .build()
            .map_err(|e| Error::config(format!("failed to read config: {e}")))?;

        let mut cfg: Config = raw
            .try_deserialize()
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Config, Error> {
        let mut cfg: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply environment overrides that carry secrets, so tokens can live in
    /// a Kubernetes Secret rather than the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(tokens) = std::env::var(AUTH_BEARER_TOKENS_ENV) {
            if !tokens.is_empty() {
                self.auth.bearer_tokens = tokens
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .collect();
            }
        }
    }

    /// Check the configuration for required fields and valid values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.proxy.listen_address.is_empty() {
            return Err(Error::config("proxy.listen_address is required"));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, cluster) in self.clusters.iter().enumerate() {
            if cluster.name.is_empty() {
                return Err(Error::config(format!("clusters[{i}].name is required")));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(Error::config(format!(
                    "clusters[{i}].name {:?} is not unique",
                    cluster.name
                )));
            }
            match cluster.cluster_type {
                ClusterType::ManagedCloud => {
                    if cluster.eks.is_none() {
                        return Err(Error::config(format!(
                            "clusters[{i}].eks is required when type is 'managed-cloud'"
                        )));
                    }
                }
                ClusterType::StaticConfig => {
                    let kc = cluster.kubeconfig.as_ref().ok_or_else(|| {
                        Error::config(format!(
                            "clusters[{i}].kubeconfig is required when type is 'static-config'"
                        ))
                    })?;
                    if kc.path.is_none() && kc.data.is_none() {
                        return Err(Error::config(format!(
                            "clusters[{i}].kubeconfig needs either path or data"
                        )));
                    }
                }
            }
            if cluster.logs.is_none() && cluster.metrics.is_none() {
                return Err(Error::config(format!(
                    "clusters[{i}] must have at least one of logs or metrics configured"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_cluster_yaml(extra: &str) -> String {
        format!(
            r#"
proxy:
  listen_address: ":9090"
clusters:
  - name: eu
    type: static-config
    kubeconfig:
      path: /etc/kubeconfigs/eu
{extra}
"#
        )
    }

    #[test]
    fn defaults_applied() {
        let cfg = Config::from_yaml("proxy: {}\n").unwrap();
        assert_eq!(cfg.proxy.listen_address, ":8080");
        assert_eq!(cfg.proxy.query_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.proxy.max_tenant_header_length, 8192);
        assert!(cfg.proxy.metrics_enabled);
        assert!(!cfg.auth.enabled);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "json");
        assert!(cfg.clusters.is_empty());
    }

    #[test]
    fn cluster_with_logs_endpoint_parses() {
        let yaml = minimal_cluster_yaml(
            r#"    logs:
      namespace: loki
      service: loki-gateway
      port: 80
      path_prefix: /loki
"#,
        );
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert_eq!(cfg.clusters.len(), 1);
        let c = &cfg.clusters[0];
        assert_eq!(c.name, "eu");
        assert_eq!(c.cluster_type, ClusterType::StaticConfig);
        let logs = c.logs.as_ref().unwrap();
        assert_eq!(logs.namespace, "loki");
        assert_eq!(logs.service, "loki-gateway");
        assert_eq!(logs.port, 80);
        assert_eq!(logs.path_prefix.as_deref(), Some("/loki"));
    }

    #[test]
    fn missing_listen_address_rejected() {
        let err = Config::from_yaml("proxy:\n  listen_address: \"\"\n").unwrap_err();
        assert!(err.to_string().contains("listen_address"));
    }

    #[test]
    fn unnamed_cluster_rejected() {
        let yaml = r#"
clusters:
  - name: ""
    type: static-config
    kubeconfig:
      path: /x
    logs:
      namespace: n
      service: s
      port: 80
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("clusters[0].name"));
    }

    #[test]
    fn duplicate_cluster_names_rejected() {
        let yaml = r#"
clusters:
  - name: eu
    type: static-config
    kubeconfig: { path: /a }
    logs: { namespace: n, service: s, port: 80 }
  - name: eu
    type: static-config
    kubeconfig: { path: /b }
    logs: { namespace: n, service: s, port: 80 }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("not unique"));
    }

    #[test]
    fn unknown_cluster_type_rejected() {
        let yaml = r#"
clusters:
  - name: eu
    type: on-prem
    logs: { namespace: n, service: s, port: 80 }
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn managed_cloud_requires_eks_block() {
        let yaml = r#"
clusters:
  - name: eu
    type: managed-cloud
    logs: { namespace: n, service: s, port: 80 }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("clusters[0].eks"));
    }

    #[test]
    fn static_config_requires_path_or_data() {
        let yaml = r#"
clusters:
  - name: eu
    type: static-config
    kubeconfig: {}
    logs: { namespace: n, service: s, port: 80 }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("path or data"));
    }

    #[test]
    fn cluster_without_endpoints_rejected() {
        let yaml = minimal_cluster_yaml("");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("at least one of logs or metrics"));
    }

    #[test]
    fn refresh_interval_zero_means_default() {
        let tenants = TenantsConfig::default();
        assert_eq!(tenants.refresh_interval(), Duration::from_secs(60));

        let tenants = TenantsConfig {
            refresh_interval_secs: 15,
            ..Default::default()
        };
        assert_eq!(tenants.refresh_interval(), Duration::from_secs(15));
    }

    #[test]
    fn bearer_tokens_env_override() {
        std::env::set_var(AUTH_BEARER_TOKENS_ENV, "tok-a, tok-b ,tok-c");
        let yaml = r#"
auth:
  enabled: true
  bearer_tokens: ["from-file"]
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        std::env::remove_var(AUTH_BEARER_TOKENS_ENV);
        assert_eq!(cfg.auth.bearer_tokens, vec!["tok-a", "tok-b", "tok-c"]);
    }
}
