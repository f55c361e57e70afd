mod decode;
mod mappings;
mod substrate;

use anyhow::{anyhow, Result};
use sieve_core::{
    describe_metrics, load_project, GraphqlNetworkIndex, IndexerManager, NodeConfig, Shutdown,
};
use sieve_db::{ConnectionPool, DbConfig, PgStorage};
use std::{process::ExitCode, sync::Arc};
use substrate::SubxtChainClient;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(shutdown: Shutdown) -> Result<()> {
    let config = NodeConfig::from_env();
    let project = load_project(&config.project_path)?;
    info!(
        project = %project.name,
        data_sources = project.data_sources.len(),
        "Loaded project"
    );

    let endpoint = config
        .network_endpoint
        .clone()
        .or_else(|| project.network.endpoint.clone())
        .ok_or_else(|| anyhow!("no network endpoint: set NETWORK_ENDPOINT or network.endpoint"))?;
    let chain = Arc::new(SubxtChainClient::connect(&endpoint).await?);

    let db_config = DbConfig::from_env();
    let pool = ConnectionPool::new(&db_config).await?;
    let storage = Arc::new(PgStorage::new(pool).await?);
    info!("Database connection pool initialized");

    describe_metrics();

    let network_indexer = config
        .network_indexer
        .clone()
        .or_else(|| project.network.network_indexer.clone());
    let mut manager = IndexerManager::new(
        config,
        project,
        chain,
        storage,
        mappings::builtin_registry(),
        shutdown,
    );
    if let Some(url) = network_indexer {
        info!(%url, "Using network index");
        manager = manager.with_network_index(Arc::new(GraphqlNetworkIndex::new(url)?));
    }
    manager.start().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.trigger();
            }
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
    });

    match run(shutdown).await {
        Ok(()) => {
            info!("Indexer stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Indexer failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
