//! Tenant discovery: per-cluster namespace watchers and their registry

pub mod watcher;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::cluster::ClusterRegistry;
use crate::config::ClusterConfig;
use crate::error::Error;

pub use watcher::{TenantFilter, TenantWatcher, WatcherState};

/// Collection of tenant watchers keyed by cluster name.
#[derive(Debug)]
pub struct TenantRegistry {
    watchers: RwLock<HashMap<String, Arc<TenantWatcher>>>,
}

impl TenantRegistry {
    /// Create a watcher for every configured cluster present in the cluster
    /// registry. Clusters missing from the registry are skipped with a
    /// warning so partial misconfiguration degrades rather than aborts;
    /// watcher construction failures (bad patterns) are hard errors.
    pub fn from_config(
        cluster_registry: &ClusterRegistry,
        configs: &[ClusterConfig],
    ) -> Result<TenantRegistry, Error> {
        let mut watchers = HashMap::new();

        for cfg in configs {
            let Some(connector) = cluster_registry.get(&cfg.name) else {
                warn!(
                    cluster = %cfg.name,
                    "cluster not found in registry, skipping tenant watcher"
                );
                continue;
            };

            let watcher = TenantWatcher::new(&cfg.name, connector.client(), &cfg.tenants)
                .map_err(|e| {
                    Error::config(format!(
                        "failed to create tenant watcher for cluster {}: {e}",
                        cfg.name
                    ))
                })?;

            info!(
                cluster = %cfg.name,
                include_patterns = cfg.tenants.include_patterns.len(),
                exclude_patterns = cfg.tenants.exclude_patterns.len(),
                "created tenant watcher"
            );
            watchers.insert(cfg.name.clone(), Arc::new(watcher));
        }

        Ok(TenantRegistry {
            watchers: RwLock::new(watchers),
        })
    }

    /// Build a registry from pre-constructed watchers.
    pub fn from_watchers(watchers: Vec<(String, Arc<TenantWatcher>)>) -> TenantRegistry {
        TenantRegistry {
            watchers: RwLock::new(watchers.into_iter().collect()),
        }
    }

    /// Start every watcher's background actor.
    pub fn start(&self) {
        let watchers = self.watchers.read().expect("tenant registry lock poisoned");
        for (name, watcher) in watchers.iter() {
            info!(cluster = %name, "starting tenant watcher");
            watcher.start_async();
        }
    }

    /// Stop every watcher. Idempotent.
    pub fn stop(&self) {
        let watchers = self.watchers.read().expect("tenant registry lock poisoned");
        for (name, watcher) in watchers.iter() {
            info!(cluster = %name, "stopping tenant watcher");
            watcher.stop();
        }
    }

    /// Look up the watcher for a cluster.
    pub fn get(&self, cluster: &str) -> Option<Arc<TenantWatcher>> {
        self.watchers
            .read()
            .expect("tenant registry lock poisoned")
            .get(cluster)
            .cloned()
    }

    /// Tenant list for a cluster; empty when the cluster has no watcher.
    pub fn tenants(&self, cluster: &str) -> Vec<String> {
        self.get(cluster)
            .map(|w| w.tenants())
            .unwrap_or_default()
    }

    /// All cluster names with a watcher.
    pub fn names(&self) -> Vec<String> {
        self.watchers
            .read()
            .expect("tenant registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Tenant counts for every watched cluster.
    pub fn counts(&self) -> HashMap<String, usize> {
        let watchers = self.watchers.read().expect("tenant registry lock poisoned");
        watchers
            .iter()
            .map(|(name, w)| (name.clone(), w.tenant_count()))
            .collect()
    }

    /// Scope header for a cluster; empty when the cluster has no watcher or
    /// no tenants.
    pub fn scope_header(&self, cluster: &str, max_len: usize) -> String {
        self.get(cluster)
            .map(|w| w.build_scope_header(max_len))
            .unwrap_or_default()
    }
}
