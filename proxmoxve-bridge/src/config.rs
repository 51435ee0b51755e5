//! Configuration management for the bridge daemon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use proxmoxve_client::{ConnectionConfig, DEFAULT_PORT, DEFAULT_REALM};

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/proxmoxve-bridge/config.yaml";

/// Refresh interval used when an entry sets none.
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 60;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Serve a simulated cluster instead of contacting real endpoints
    pub dev: bool,
    /// Configured Proxmox VE connections
    pub entries: Vec<EntryConfig>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Load the configuration the daemon should run with.
    ///
    /// An explicit path must load. Without one, `default_path` is used when
    /// it exists, and built-in defaults when it does not. A default file that
    /// exists but fails to load is an error. Returns the path actually read.
    pub fn resolve<P: AsRef<Path>>(
        explicit: Option<&str>,
        default_path: P,
    ) -> Result<(Self, Option<String>)> {
        if let Some(path) = explicit {
            let config = Self::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path))?;
            return Ok((config, Some(path.to_string())));
        }

        let default_path = default_path.as_ref();
        if !default_path.exists() {
            return Ok((Self::default(), None));
        }

        let config = Self::load(default_path).with_context(|| {
            format!("Failed to load configuration from {}", default_path.display())
        })?;
        Ok((config, Some(default_path.display().to_string())))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.clone();
        }

        if args.dev {
            self.dev = true;
        }

        self
    }

    /// Reject configurations that cannot be set up.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;

        let mut seen = HashSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !seen.insert(entry.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate entry id: {}", entry.id));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for the REST API
    pub listen_address: String,
    /// Browser origins allowed to call the API cross-origin (none by default)
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8099".to_string(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        for origin in &self.cors_allowed_origins {
            if !(origin.starts_with("http://") || origin.starts_with("https://")) {
                return Err(anyhow::anyhow!(
                    "cors_allowed_origins: '{}' is not an http(s) origin",
                    origin
                ));
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// One configured connection to a Proxmox VE cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Unique entry identifier
    pub id: String,
    /// API host name or address
    pub serverip: String,
    #[serde(default = "default_port")]
    pub serverport: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Verify the server certificate
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// Options that may change after setup
    #[serde(default)]
    pub options: EntryOptions,
}

impl EntryConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(
            self.serverip.clone(),
            self.serverport,
            self.username.clone(),
            self.realm.clone(),
            self.password.clone(),
            self.verify_tls,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow::anyhow!("Entry id must not be empty"));
        }
        if self.serverip.trim().is_empty() {
            return Err(anyhow::anyhow!("Entry {}: serverip must not be empty", self.id));
        }
        if self.username.trim().is_empty() {
            return Err(anyhow::anyhow!("Entry {}: username must not be empty", self.id));
        }
        if self.serverport == 0 {
            return Err(anyhow::anyhow!("Entry {}: serverport must not be 0", self.id));
        }
        self.options
            .validate()
            .with_context(|| format!("Entry {}", self.id))
    }
}

/// Entry options. Changing them tears the entry down and sets it up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryOptions {
    /// Seconds between refresh cycles
    pub update_interval_secs: u64,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
        }
    }
}

impl EntryOptions {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_interval_secs == 0 {
            return Err(anyhow::anyhow!("update_interval_secs must be greater than 0"));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}

fn default_verify_tls() -> bool {
    true
}
