// src/main.rs

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod deployment;
mod error;
mod lifecycle;
mod pool;
mod provisioning;
mod registry;
mod server;
mod sys;
#[cfg(test)]
mod testing;
mod wireguard;

use crate::config::{PoolConfig, ProviderConfig};
use crate::deployment::DeploymentTracker;
use crate::error::PoolError;
use crate::pool::{Pool, run_reclamation_loop};
use crate::registry::ServerRegistry;
use crate::server::AppState;
use crate::sys::provider::{DigitalOceanProvider, StaticServerProvider, VultrProvider};
use crate::sys::ssh::SshExecutor;
use crate::sys::traits::{ComputeProvider, RemoteExecutor};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_provider(config: &PoolConfig) -> Result<Arc<dyn ComputeProvider>, PoolError> {
    let provider: Arc<dyn ComputeProvider> = match &config.provider {
        ProviderConfig::Vultr { api_key, region, plan } => Arc::new(
            VultrProvider::new(api_key.clone(), region.clone(), plan.clone(), config.http_timeout)
                .map_err(PoolError::Config)?,
        ),
        ProviderConfig::DigitalOcean { token, region, size } => Arc::new(
            DigitalOceanProvider::new(token.clone(), region.clone(), size.clone(), config.http_timeout)
                .map_err(PoolError::Config)?,
        ),
        ProviderConfig::Static { address } => Arc::new(StaticServerProvider::new(*address)),
    };
    Ok(provider)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, draining connections");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Logging
    // ==============================================================================

    // A bad environment refuses to start before anything touches the network.
    let config = PoolConfig::load()?;
    init_tracing(config.log_json);

    info!(
        provider = %config.provider_kind(),
        max_peers = config.max_peers_per_server,
        state_file = %config.state_file.display(),
        "⚙️ wgpool starting"
    );

    // ==============================================================================
    // 2. Adapters & Registry
    // ==============================================================================

    let provider = build_provider(&config)?;
    let executor: Arc<dyn RemoteExecutor> =
        Arc::new(SshExecutor::new(config.ssh_timeout, config.known_hosts.clone()));
    let registry = Arc::new(ServerRegistry::open(&config.state_file).await?);

    let pool = Arc::new(Pool::new(registry, provider, executor, config.pool_settings()));

    // ==============================================================================
    // 3. Background Reclamation & API
    // ==============================================================================

    match config.sweep_interval {
        Some(every) => {
            info!("periodic idle sweep every {}s", every.as_secs());
            tokio::spawn(run_reclamation_loop(pool.clone(), every));
        }
        None => info!("periodic idle sweep disabled; reclamation runs after disconnects only"),
    }

    let state = AppState {
        pool,
        deployments: Arc::new(DeploymentTracker::new()),
        provider: config.provider_kind(),
    };

    server::serve(state, &config.listen, shutdown_signal()).await?;

    info!("wgpool stopped");
    Ok(())
}
