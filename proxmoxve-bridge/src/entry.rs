//! Entry lifecycle.
//!
//! An entry is one configured connection. Setting it up builds a session
//! client and a coordinator and spawns the entry's task. The task performs
//! the initial refresh, registers the entry's VM action services once a
//! refresh has succeeded, and then runs the periodic loop.
//!
//! An entry whose initial refresh fails is not ready: it keeps its
//! configuration and coordinator, has no services, and its task retries the
//! initial refresh with exponential backoff. Unloading reverses all of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use proxmoxve_client::{Connector, SessionClient};

use crate::config::{EntryConfig, EntryOptions};
use crate::coordinator::{CoordinatorState, RefreshCoordinator, RefreshFailed, RefreshOutcome};
use crate::services::{ServiceError, ServiceRegistry};

/// First delay before retrying a not-ready entry.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Upper bound of the retry delay.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(300);

/// Errors from entry setup and teardown.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Invalid entry configuration: {0}")]
    InvalidConfig(String),

    #[error("Entry already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Entry not loaded: {0}")]
    NotLoaded(String),

    /// The initial refresh failed. The entry stays registered and retries.
    #[error("Entry {id} not ready: {source}")]
    NotReady {
        id: String,
        #[source]
        source: RefreshFailed,
    },
}

type FirstRefresh = oneshot::Receiver<Result<(), RefreshFailed>>;

/// A registered entry. Dropping it stops its task.
struct LoadedEntry {
    config: EntryConfig,
    coordinator: Arc<RefreshCoordinator>,
    /// Set once a refresh succeeded and the services are registered
    ready: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Drop for LoadedEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Status of an entry, as reported over the API.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub id: String,
    pub endpoint: String,
    pub username: String,
    pub update_interval_secs: u64,
    pub ready: bool,
    pub state: CoordinatorState,
    pub last_update_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    pub services: Vec<&'static str>,
}

/// Owns every entry of the process.
pub struct EntryRegistry {
    connector: Arc<dyn Connector>,
    services: Arc<ServiceRegistry>,
    entries: RwLock<HashMap<String, LoadedEntry>>,
    /// Serializes registration changes; never held across a refresh
    lifecycle: Mutex<()>,
    retry_initial: Duration,
    retry_max: Duration,
}

impl EntryRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            services: Arc::new(ServiceRegistry::new()),
            entries: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            retry_initial: RETRY_INITIAL_DELAY,
            retry_max: RETRY_MAX_DELAY,
        }
    }

    /// Override the retry backoff of not-ready entries.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max.max(initial);
        self
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Set up an entry and wait for its initial refresh.
    ///
    /// On [`SetupError::NotReady`] the entry remains registered without
    /// services and keeps retrying in the background.
    pub async fn setup_entry(&self, config: EntryConfig) -> Result<Arc<RefreshCoordinator>, SetupError> {
        validate(&config)?;
        let id = config.id.clone();

        let started = {
            let _lifecycle = self.lifecycle.lock().await;
            self.start_locked(config).await?
        };
        await_first_refresh(id, started).await
    }

    /// Unload an entry, returning its configuration.
    pub async fn unload_entry(&self, id: &str) -> Result<EntryConfig, SetupError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.unload_locked(id).await
    }

    /// Replace an entry's options by unloading it and setting it up again.
    ///
    /// The new configuration is registered even if its initial refresh fails;
    /// the entry is then not ready and retries.
    pub async fn update_options(
        &self,
        id: &str,
        options: EntryOptions,
    ) -> Result<Arc<RefreshCoordinator>, SetupError> {
        options
            .validate()
            .map_err(|e| SetupError::InvalidConfig(format!("{:#}", e)))?;

        let started = {
            let _lifecycle = self.lifecycle.lock().await;
            let mut config = self.unload_locked(id).await?;
            info!(
                entry_id = %id,
                update_interval_secs = options.update_interval_secs,
                "Options changed, reloading entry"
            );
            config.options = options;
            self.start_locked(config).await?
        };
        await_first_refresh(id.to_string(), started).await
    }

    /// Unload an entry and set it up again with the same configuration.
    pub async fn reload_entry(&self, id: &str) -> Result<Arc<RefreshCoordinator>, SetupError> {
        let started = {
            let _lifecycle = self.lifecycle.lock().await;
            let config = self.unload_locked(id).await?;
            self.start_locked(config).await?
        };
        await_first_refresh(id.to_string(), started).await
    }

    /// Unload every entry.
    pub async fn unload_all(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.unload_locked(&id).await;
        }
    }

    /// Coordinator of a registered entry, ready or not.
    pub async fn coordinator(&self, id: &str) -> Option<Arc<RefreshCoordinator>> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.coordinator.clone())
    }

    pub async fn entry_config(&self, id: &str) -> Option<EntryConfig> {
        self.entries.read().await.get(id).map(|entry| entry.config.clone())
    }

    /// Whether the entry is registered, ready or not.
    pub async fn is_loaded(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Whether the entry has completed a refresh and registered its services.
    pub async fn is_ready(&self, id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.ready.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Summaries of every entry, sorted by id.
    pub async fn summaries(&self) -> Vec<EntrySummary> {
        let entries = self.entries.read().await;
        let mut summaries: Vec<EntrySummary> = entries
            .iter()
            .map(|(id, entry)| {
                let coordinator = &entry.coordinator;
                EntrySummary {
                    id: id.clone(),
                    endpoint: coordinator.endpoint(),
                    username: coordinator.client().config().user_id(),
                    update_interval_secs: coordinator.update_interval().as_secs(),
                    ready: entry.ready.load(Ordering::Acquire),
                    state: coordinator.state(),
                    last_update_success: coordinator.last_update_success(),
                    last_error: coordinator.last_error().map(|e| e.to_string()),
                    refreshed_at: coordinator.snapshot().map(|s| s.refreshed_at),
                    services: self.services.services(id),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Dispatch a service call for a ready entry.
    pub async fn call_service(&self, id: &str, service: &str, payload: &Value) -> Result<Value, ServiceError> {
        self.services.call(id, service, payload).await
    }

    /// Register the entry and spawn its task. The caller holds `lifecycle`.
    #[instrument(skip(self, config), fields(entry_id = %config.id))]
    async fn start_locked(
        &self,
        config: EntryConfig,
    ) -> Result<(Arc<RefreshCoordinator>, FirstRefresh), SetupError> {
        validate(&config)?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&config.id) {
            return Err(SetupError::AlreadyLoaded(config.id.clone()));
        }

        let client = Arc::new(SessionClient::new(config.connection(), self.connector.clone()));
        let coordinator = Arc::new(RefreshCoordinator::new(
            client.clone(),
            config.options.update_interval(),
        ));
        let ready = Arc::new(AtomicBool::new(false));
        let (first_tx, first_rx) = oneshot::channel();

        let task = tokio::spawn(
            EntryTask {
                id: config.id.clone(),
                client,
                coordinator: coordinator.clone(),
                services: self.services.clone(),
                ready: ready.clone(),
                retry_initial: self.retry_initial,
                retry_max: self.retry_max,
            }
            .run(first_tx),
        );

        info!(
            endpoint = %coordinator.endpoint(),
            update_interval_secs = config.options.update_interval_secs,
            "Entry registered"
        );

        entries.insert(
            config.id.clone(),
            LoadedEntry {
                config,
                coordinator: coordinator.clone(),
                ready,
                task,
            },
        );

        Ok((coordinator, first_rx))
    }

    /// Remove the entry, stop its task and unregister its services.
    async fn unload_locked(&self, id: &str) -> Result<EntryConfig, SetupError> {
        let mut entry = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SetupError::NotLoaded(id.to_string()))?;

        // the task may be registering services; wait for it to stop first
        entry.task.abort();
        let _ = (&mut entry.task).await;
        self.services.unregister(id);
        info!(entry_id = %id, "Entry unloaded");

        Ok(entry.config.clone())
    }
}

fn validate(config: &EntryConfig) -> Result<(), SetupError> {
    config
        .validate()
        .map_err(|e| SetupError::InvalidConfig(format!("{:#}", e)))
}

async fn await_first_refresh(
    id: String,
    (coordinator, first): (Arc<RefreshCoordinator>, FirstRefresh),
) -> Result<Arc<RefreshCoordinator>, SetupError> {
    match first.await {
        Ok(Ok(())) => Ok(coordinator),
        Ok(Err(source)) => Err(SetupError::NotReady { id, source }),
        // unloaded before the first attempt finished
        Err(_) => Err(SetupError::NotLoaded(id)),
    }
}

/// Background work of one entry.
struct EntryTask {
    id: String,
    client: Arc<SessionClient>,
    coordinator: Arc<RefreshCoordinator>,
    services: Arc<ServiceRegistry>,
    ready: Arc<AtomicBool>,
    retry_initial: Duration,
    retry_max: Duration,
}

impl EntryTask {
    #[instrument(skip_all, fields(entry_id = %self.id))]
    async fn run(self, first: oneshot::Sender<Result<(), RefreshFailed>>) {
        let mut first = Some(first);
        let mut delay = self.retry_initial;

        loop {
            match self.coordinator.refresh().await {
                Ok(RefreshOutcome::Published(_)) => {
                    self.services.register_vm_actions(&self.id, self.client.clone());
                    self.ready.store(true, Ordering::Release);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    break;
                }
                // another trigger owns the cycle; try again after the delay
                Ok(RefreshOutcome::Skipped) => {}
                Err(e) => match first.take() {
                    Some(tx) => {
                        warn!(error = %e, retry_in_secs = delay.as_secs_f64(), "Initial refresh failed, entry not ready");
                        let _ = tx.send(Err(e));
                    }
                    None => {
                        warn!(error = %e, retry_in_secs = delay.as_secs_f64(), "Entry still not ready");
                    }
                },
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.retry_max);
        }

        info!(endpoint = %self.coordinator.endpoint(), "Entry ready");

        self.coordinator.run().await;
    }
}
