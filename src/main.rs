//! Observability federation proxy - multi-cluster Loki and Mimir gateway

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use obs_federation_proxy::cluster::ClusterRegistry;
use obs_federation_proxy::config::{Config, LoggingConfig};
use obs_federation_proxy::tenant::TenantRegistry;
use obs_federation_proxy::{metrics, server};

/// Proxy for federating Loki and Mimir queries across Kubernetes clusters.
///
/// Exposes a single Grafana-facing HTTP surface and forwards each query to
/// the addressed cluster's in-cluster Loki or Mimir service through the
/// Kubernetes API server's service proxy.
#[derive(Parser, Debug)]
#[command(name = "obs-federation-proxy", version, about, long_about = None)]
struct Cli {
    /// Config file (default is ./config.yaml)
    #[arg(long, env = "OFP_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    init_tracing(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_address = %config.proxy.listen_address,
        cluster_count = config.clusters.len(),
        "starting observability federation proxy"
    );

    if config.proxy.metrics_enabled {
        metrics::install().context("failed to initialize metrics")?;
    }

    let config = Arc::new(config);

    let clusters = if config.clusters.is_empty() {
        None
    } else {
        let registry = ClusterRegistry::from_config(&config.clusters)
            .await
            .context("failed to create cluster registry")?;
        tracing::info!(
            cluster_count = registry.names().len(),
            "cluster registry initialized"
        );
        Some(Arc::new(registry))
    };

    let tenants = match &clusters {
        Some(registry) => {
            let tenants = TenantRegistry::from_config(registry, &config.clusters)
                .context("failed to create tenant registry")?;
            tenants.start();
            tracing::info!(clusters = ?tenants.names(), "tenant registry initialized");
            Arc::new(tenants)
        }
        None => Arc::new(TenantRegistry::from_watchers(Vec::new())),
    };

    let state = server::AppState::new(config, clusters, tenants);
    server::run(state, server::shutdown_signal()).await?;

    tracing::info!("shut down cleanly");
    Ok(())
}

fn init_tracing(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .context("failed to construct tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let result = if cfg.format == "text" {
        builder.compact().try_init()
    } else {
        builder.json().flatten_event(true).try_init()
    };

    result.map_err(|err| anyhow!("failed to initialize tracing subscriber: {err}"))
}
