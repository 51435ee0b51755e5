//! Command-line argument parsing.

use clap::Parser;

/// proxmoxve-bridge - Proxmox VE polling and VM action daemon
#[derive(Parser, Debug, Default)]
#[command(name = "proxmoxve-bridge")]
#[command(about = "Polls Proxmox VE clusters and exposes VM lifecycle services")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults to /etc/proxmoxve-bridge/config.yaml)
    #[arg(short, long, env = "PROXMOXVE_BRIDGE_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Listen address for the REST API
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable development mode (simulated cluster)
    #[arg(long)]
    pub dev: bool,
}
