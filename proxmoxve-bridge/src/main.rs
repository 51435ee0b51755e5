//! # proxmoxve Bridge Daemon
//!
//! Polls the configured Proxmox VE clusters on a fixed interval and exposes
//! their snapshots and VM lifecycle services over a REST API.
//!
//! ## Usage
//! ```bash
//! proxmoxve-bridge --config /etc/proxmoxve-bridge/config.yaml
//! proxmoxve-bridge --dev   # simulated cluster
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use proxmoxve_bridge::cli::Args;
use proxmoxve_bridge::config::{Config, EntryConfig, DEFAULT_CONFIG_PATH};
use proxmoxve_bridge::entry::{EntryRegistry, SetupError};
use proxmoxve_bridge::http_server;
use proxmoxve_client::{Connector, HttpConnector, MockCluster, MockConnector};
use proxmoxve_common::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so its level and format apply
    let (config, source) = Config::resolve(args.config.as_deref(), DEFAULT_CONFIG_PATH)?;
    let config = config.with_cli_overrides(&args);

    match config.logging.format.parse::<LogFormat>()? {
        LogFormat::Pretty => proxmoxve_common::init_logging(&config.logging.level)?,
        LogFormat::Json => proxmoxve_common::init_logging_json(&config.logging.level)?,
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting proxmoxve bridge");
    match source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using CLI arguments and defaults"),
    }

    let connector: Arc<dyn Connector> = if config.dev {
        warn!("Development mode: serving a simulated cluster");
        Arc::new(MockConnector::new(Arc::new(MockCluster::demo())))
    } else {
        Arc::new(HttpConnector::new())
    };

    let mut entries = config.entries.clone();
    if entries.is_empty() && config.dev {
        entries.push(dev_entry());
    }

    let registry = Arc::new(EntryRegistry::new(connector));
    setup_entries(&registry, entries).await;

    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.server.listen_address))?;

    let result = http_server::run_http_server(
        addr,
        registry.clone(),
        &config.server.cors_allowed_origins,
        shutdown_signal(),
    )
    .await;

    registry.unload_all().await;
    if let Err(e) = &result {
        error!(error = %e, "Server failed");
    }
    info!("proxmoxve bridge stopped");
    result
}

/// Set up every entry concurrently. An entry that is not ready keeps
/// retrying in the background; any other failure is logged and skipped.
async fn setup_entries(registry: &Arc<EntryRegistry>, entries: Vec<EntryConfig>) {
    let total = entries.len();
    let results = futures::future::join_all(entries.into_iter().map(|entry| {
        let registry = registry.clone();
        async move {
            let id = entry.id.clone();
            (id, registry.setup_entry(entry).await)
        }
    }))
    .await;

    let mut ready = 0;
    for (id, result) in results {
        match result {
            Ok(_) => ready += 1,
            Err(e @ SetupError::NotReady { .. }) => {
                warn!(entry_id = %id, error = %e, "Entry not ready, retrying in background")
            }
            Err(e) => error!(entry_id = %id, error = %e, "Failed to set up entry"),
        }
    }
    info!(ready, total, "Entries set up");
}

fn dev_entry() -> EntryConfig {
    EntryConfig {
        id: "dev".to_string(),
        serverip: "pve.dev.local".to_string(),
        serverport: proxmoxve_client::DEFAULT_PORT,
        username: "root".to_string(),
        password: "dev".to_string(),
        realm: proxmoxve_client::DEFAULT_REALM.to_string(),
        verify_tls: false,
        options: Default::default(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
