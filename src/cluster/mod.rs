//! Per-cluster connectors and the cluster registry
//!
//! A [`Connector`] owns the authenticated transports aimed at one cluster's
//! API server: a `kube::Client` for typed API access (namespace watches,
//! server-version health probes) and a `reqwest::Client` for the raw
//! service-proxy tunnel. The [`ClusterRegistry`] holds the full set and fans
//! out health probes.
//!
//! Two credential flavors exist. The managed-cloud flavor authenticates with
//! short-lived presigned EKS tokens minted under lock ([`eks`]); the
//! static-config flavor takes everything from a kubeconfig document
//! ([`kubeconfig`]). Both yield the same `Connector` contract.

pub mod eks;
pub mod kubeconfig;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::config::{ClusterConfig, ClusterType};
use crate::error::Error;

pub use eks::TokenCell;

/// An authenticated connection to one Kubernetes cluster.
pub struct Connector {
    name: String,
    config: ClusterConfig,
    kube: kube::Client,
    http: reqwest::Client,
    base_url: String,
    auth: ConnectorAuth,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

/// Request-time authentication material for the tunnel transport.
///
/// TLS client identities are baked into the `reqwest::Client` at build time,
/// so they carry no per-request material here.
#[derive(Debug)]
pub(crate) enum ConnectorAuth {
    /// Short-lived EKS bearer tokens refreshed through the token cell
    Eks(Arc<TokenCell>),
    /// Fixed bearer token from the kubeconfig user entry
    Bearer(String),
    /// Basic credentials from the kubeconfig user entry
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// No per-request material (TLS client identity or unauthenticated)
    None,
}

impl Connector {
    /// Construct a connector for the given cluster configuration.
    ///
    /// Credential material is verified (files readable, blobs decodable,
    /// documents parseable); network reachability is probed separately via
    /// [`Connector::health`]. The managed-cloud flavor does describe the
    /// remote cluster here to learn its endpoint and CA.
    pub async fn build(cfg: &ClusterConfig) -> Result<Connector, Error> {
        match cfg.cluster_type {
            ClusterType::ManagedCloud => eks::build(cfg).await,
            ClusterType::StaticConfig => kubeconfig::build(cfg).await,
        }
    }

    pub(crate) fn from_parts(
        cfg: &ClusterConfig,
        kube: kube::Client,
        http: reqwest::Client,
        base_url: String,
        auth: ConnectorAuth,
    ) -> Connector {
        Connector {
            name: cfg.name.clone(),
            config: cfg.clone(),
            kube,
            http,
            base_url,
            auth,
        }
    }

    /// The cluster's stable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cluster configuration this connector was built from.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The authenticated Kubernetes client for this cluster.
    pub fn client(&self) -> kube::Client {
        self.kube.clone()
    }

    /// Base URL of the cluster's API server.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Bearer token to attach to a tunnel request, if this flavor uses one.
    pub(crate) async fn bearer_token(&self) -> Result<Option<String>, Error> {
        match &self.auth {
            ConnectorAuth::Eks(cell) => Ok(Some(cell.bearer_token().await?)),
            ConnectorAuth::Bearer(token) => Ok(Some(token.clone())),
            ConnectorAuth::Basic { .. } | ConnectorAuth::None => Ok(None),
        }
    }

    pub(crate) fn basic_auth(&self) -> Option<(&str, &str)> {
        match &self.auth {
            ConnectorAuth::Basic { username, password } => {
                Some((username.as_str(), password.as_str()))
            }
            _ => None,
        }
    }

    /// Issue one trivial authenticated call (server-version discovery) and
    /// return its outcome.
    pub async fn health(&self) -> Result<(), Error> {
        self.kube.apiserver_version().await?;
        Ok(())
    }
}

/// Shared defaults for the tunnel HTTP clients built by both flavors.
pub(crate) fn http_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(crate::PRODUCT_NAME)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(std::time::Duration::from_secs(10))
}

/// Registry of connectors keyed by cluster name.
///
/// The map is write-once at construction; the read/write lock exists for
/// uniformity with the other shared registries.
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<Connector>>>,
}

impl ClusterRegistry {
    /// Build a connector for every configured cluster. The first failure
    /// aborts construction.
    pub async fn from_config(configs: &[ClusterConfig]) -> Result<ClusterRegistry, Error> {
        let mut clusters = HashMap::with_capacity(configs.len());

        for cfg in configs {
            let connector = Connector::build(cfg).await.map_err(|e| {
                Error::cluster(format!("failed to create cluster {}: {e}", cfg.name))
            })?;
            info!(
                cluster = %cfg.name,
                r#type = cfg.cluster_type.as_str(),
                "registered cluster"
            );
            clusters.insert(cfg.name.clone(), Arc::new(connector));
        }

        Ok(ClusterRegistry {
            clusters: RwLock::new(clusters),
        })
    }

    pub(crate) fn from_connectors(connectors: Vec<Arc<Connector>>) -> ClusterRegistry {
        let clusters = connectors
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        ClusterRegistry {
            clusters: RwLock::new(clusters),
        }
    }

    /// Look up a connector by cluster name.
    pub fn get(&self, name: &str) -> Option<Arc<Connector>> {
        self.clusters
            .read()
            .expect("cluster registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All registered cluster names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.clusters
            .read()
            .expect("cluster registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Probe every cluster concurrently and collect the outcomes.
    ///
    /// Total time is bounded by the slowest probe; slow probes are not
    /// cancelled beyond the caller dropping this future.
    pub async fn health(&self) -> HashMap<String, Result<(), Error>> {
        let snapshot: Vec<Arc<Connector>> = {
            let clusters = self
                .clusters
                .read()
                .expect("cluster registry lock poisoned");
            clusters.values().cloned().collect()
        };

        let probes = snapshot.into_iter().map(|connector| async move {
            let outcome = connector.health().await;
            (connector.name().to_string(), outcome)
        });

        futures::future::join_all(probes).await.into_iter().collect()
    }
}
