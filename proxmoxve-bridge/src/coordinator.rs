//! Refresh Coordinator - periodic, all-or-nothing cluster snapshot refresh.
//!
//! Each cycle:
//! - Rebuilds the API session (full re-authentication)
//! - Lists nodes, then for every node in order lists its VMs and storage
//! - Publishes the assembled snapshot, or publishes nothing on any failure
//!
//! Cycles never overlap for one coordinator: a trigger that arrives while a
//! cycle is in flight is dropped. A cycle that exceeds the deadline is
//! cancelled without publishing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use proxmoxve_client::{ProxmoxError, SessionClient};
use proxmoxve_common::TimedOperation;

use crate::snapshot::{ClusterSnapshot, NodeRecord};

/// Overall deadline for one refresh cycle.
pub const REFRESH_DEADLINE: Duration = Duration::from_secs(30);

/// Why a refresh cycle was abandoned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshCause {
    #[error(transparent)]
    Remote(#[from] ProxmoxError),

    #[error("refresh exceeded deadline of {}s", .0.as_secs())]
    DeadlineExceeded(Duration),
}

/// A refresh cycle failed; nothing was published.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Error communicating with Proxmox VE at {endpoint}: {cause}")]
pub struct RefreshFailed {
    pub endpoint: String,
    #[source]
    pub cause: RefreshCause,
}

/// Result of a refresh trigger that did not fail.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// A new snapshot was published
    Published(Arc<ClusterSnapshot>),
    /// Another cycle was already in flight; this trigger was a no-op
    Skipped,
}

/// Whether a cycle is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Idle,
    Refreshing,
}

/// Owns the authoritative cluster snapshot of one entry.
pub struct RefreshCoordinator {
    /// Session client used for all reads
    client: Arc<SessionClient>,
    /// Time between periodic cycles
    update_interval: Duration,
    /// Deadline for one cycle
    deadline: Duration,
    /// Latest published snapshot; observers subscribe to it
    snapshot_tx: watch::Sender<Option<Arc<ClusterSnapshot>>>,
    /// Sticky: false from a failed cycle until the next published one
    last_update_success: AtomicBool,
    /// Failure of the most recent cycle, if it failed
    last_error: Mutex<Option<RefreshFailed>>,
    /// Held for the duration of a cycle
    cycle_lock: tokio::sync::Mutex<()>,
    /// Channel for immediate refresh requests
    refresh_tx: mpsc::Sender<()>,
    /// Receiver for refresh requests (moved into `run`)
    refresh_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl RefreshCoordinator {
    pub fn new(client: Arc<SessionClient>, update_interval: Duration) -> Self {
        // capacity 1: a pending request absorbs any further ones
        let (tx, rx) = mpsc::channel(1);
        let (snapshot_tx, _) = watch::channel(None);

        Self {
            client,
            update_interval,
            deadline: REFRESH_DEADLINE,
            snapshot_tx,
            last_update_success: AtomicBool::new(false),
            last_error: Mutex::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
            refresh_tx: tx,
            refresh_rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Override the per-cycle deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn client(&self) -> &Arc<SessionClient> {
        &self.client
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    /// `host:port` of the polled endpoint.
    pub fn endpoint(&self) -> String {
        self.client.config().endpoint()
    }

    /// Latest published snapshot, kept across failed cycles.
    pub fn snapshot(&self) -> Option<Arc<ClusterSnapshot>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receive every snapshot published from now on.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClusterSnapshot>>> {
        self.snapshot_tx.subscribe()
    }

    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<RefreshFailed> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> CoordinatorState {
        match self.cycle_lock.try_lock() {
            Ok(_) => CoordinatorState::Idle,
            Err(_) => CoordinatorState::Refreshing,
        }
    }

    /// Ask the running loop for an immediate cycle.
    ///
    /// Returns `false` when a request is already pending.
    pub fn request_refresh(&self) -> bool {
        self.refresh_tx.try_send(()).is_ok()
    }

    /// Run one refresh cycle now.
    ///
    /// Returns [`RefreshOutcome::Skipped`] without touching the remote when a
    /// cycle is already in flight.
    #[instrument(skip(self), fields(endpoint = %self.endpoint()))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshFailed> {
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Refresh already in flight, trigger dropped");
                return Ok(RefreshOutcome::Skipped);
            }
        };

        let op = TimedOperation::new("refresh", self.endpoint());
        debug!("Refresh cycle started");

        let cause = match tokio::time::timeout(self.deadline, self.fetch_snapshot()).await {
            Ok(Ok(snapshot)) => {
                let snapshot = Arc::new(snapshot);
                self.snapshot_tx.send_replace(Some(snapshot.clone()));
                self.last_update_success.store(true, Ordering::Release);
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;

                info!(
                    nodes = snapshot.nodes.len(),
                    vms = snapshot.vm_count(),
                    storage = snapshot.storage_count(),
                    "Cluster snapshot published"
                );
                op.finish();
                return Ok(RefreshOutcome::Published(snapshot));
            }
            Ok(Err(e)) => RefreshCause::Remote(e),
            Err(_) => RefreshCause::DeadlineExceeded(self.deadline),
        };

        let failure = RefreshFailed {
            endpoint: self.endpoint(),
            cause,
        };
        self.last_update_success.store(false, Ordering::Release);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(failure.clone());

        warn!(error = %failure.cause, "Error communicating with Proxmox VE for {}", failure.endpoint);
        Err(failure)
    }

    /// Rebuild the session and read the whole cluster.
    async fn fetch_snapshot(&self) -> Result<ClusterSnapshot, ProxmoxError> {
        let session = self.client.build_session().await?;

        let items = session.list_nodes().await?;
        let mut nodes = Vec::with_capacity(items.len());

        for item in items {
            let mut record = NodeRecord::from_item(item)?;
            record.vms = session.list_vms(&record.node).await?;
            record.storage = session.list_storage(&record.node).await?;
            debug!(
                node = %record.node,
                vms = record.vms.len(),
                storage = record.storage.len(),
                "Node refreshed"
            );
            nodes.push(record);
        }

        Ok(ClusterSnapshot::new(nodes))
    }

    /// Start the periodic refresh loop.
    ///
    /// The first periodic cycle runs one interval after start, since entry
    /// setup performs the initial refresh itself. Failures are logged and the
    /// next tick tries again.
    #[instrument(skip(self), fields(endpoint = %self.endpoint()))]
    pub async fn run(&self) {
        // Take the receiver (can only be taken once)
        let mut refresh_rx = match self.refresh_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("RefreshCoordinator::run called multiple times - only one loop allowed");
                return;
            }
        };

        info!(update_interval_secs = self.update_interval.as_secs(), "Starting refresh loop");

        let mut timer = interval_at(Instant::now() + self.update_interval, self.update_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let _ = self.refresh().await;
                }
                Some(_) = refresh_rx.recv() => {
                    debug!("Immediate refresh requested");
                    let _ = self.refresh().await;
                    // Reset interval to avoid double refresh
                    timer.reset();
                }
            }
        }
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("endpoint", &self.endpoint())
            .field("update_interval", &self.update_interval)
            .field("deadline", &self.deadline)
            .field("state", &self.state())
            .field("last_update_success", &self.last_update_success())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxmoxve_client::{MockCluster, MockConnector, VmAction};
    use serde_json::json;

    fn coordinator(cluster: &Arc<MockCluster>) -> RefreshCoordinator {
        let client = SessionClient::configure(
            "10.0.0.5",
            8006,
            "root",
            "pam",
            "secret",
            true,
            Arc::new(MockConnector::new(cluster.clone())),
        );
        RefreshCoordinator::new(Arc::new(client), Duration::from_secs(60))
    }

    fn five_node_cluster() -> Arc<MockCluster> {
        let cluster = Arc::new(MockCluster::new());
        for i in 1..=5u32 {
            let vms = (0..i).map(|v| json!({"vmid": 100 * i + v, "status": "running"})).collect();
            let storage = (0..(6 - i)).map(|s| json!({"storage": format!("store{}", s)})).collect();
            cluster.add_node(json!({"node": format!("pve{}", i), "status": "online"}), vms, storage);
        }
        cluster
    }

    #[tokio::test]
    async fn test_successful_cycle_publishes_every_node_in_order() {
        let cluster = five_node_cluster();
        let coordinator = coordinator(&cluster);

        let outcome = coordinator.refresh().await.unwrap();
        let RefreshOutcome::Published(snapshot) = outcome else {
            panic!("expected a published snapshot");
        };

        let names: Vec<&str> = snapshot.nodes.iter().map(|n| n.node.as_str()).collect();
        assert_eq!(names, vec!["pve1", "pve2", "pve3", "pve4", "pve5"]);
        for (i, node) in snapshot.nodes.iter().enumerate() {
            let i = i as u32 + 1;
            assert_eq!(node.vms.len() as u32, i);
            assert_eq!(node.storage.len() as u32, 6 - i);
            assert_eq!(node.vms[0]["vmid"], json!(100 * i));
        }
        assert!(coordinator.last_update_success());
        assert_eq!(coordinator.snapshot().unwrap().nodes.len(), 5);
    }

    #[tokio::test]
    async fn test_reads_are_sequential_per_node() {
        let cluster = five_node_cluster();
        cluster.remove_node("pve3");
        cluster.remove_node("pve4");
        cluster.remove_node("pve5");
        let coordinator = coordinator(&cluster);

        coordinator.refresh().await.unwrap();
        assert_eq!(
            cluster.reads(),
            vec![
                "/nodes",
                "/nodes/pve1/qemu",
                "/nodes/pve1/storage",
                "/nodes/pve2/qemu",
                "/nodes/pve2/storage",
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_on_third_node_publishes_nothing() {
        let cluster = five_node_cluster();
        let coordinator = coordinator(&cluster);

        coordinator.refresh().await.unwrap();
        let before = coordinator.snapshot().unwrap();

        cluster.fail_read("/nodes/pve3/qemu", ProxmoxError::Connectivity("timed out".into()));

        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err.endpoint, "10.0.0.5:8006");
        assert_eq!(
            err.cause,
            RefreshCause::Remote(ProxmoxError::Connectivity("timed out".into()))
        );
        assert!(!coordinator.last_update_success());
        assert!(Arc::ptr_eq(&before, &coordinator.snapshot().unwrap()));
        // the failed cycle stopped at pve3; pve4 was only read by the first cycle
        let pve4_reads = cluster.reads().iter().filter(|p| *p == "/nodes/pve4/qemu").count();
        assert_eq!(pve4_reads, 1);
    }

    #[tokio::test]
    async fn test_failure_before_any_snapshot() {
        let cluster = five_node_cluster();
        cluster.reject_credentials(true);
        let coordinator = coordinator(&cluster);

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(
            err.cause,
            RefreshCause::Remote(ProxmoxError::Authentication { .. })
        ));
        assert!(coordinator.snapshot().is_none());
        assert!(coordinator.last_error().is_some());
    }

    #[tokio::test]
    async fn test_failure_flag_is_sticky_until_next_success() {
        let cluster = five_node_cluster();
        let coordinator = coordinator(&cluster);

        cluster.set_unreachable(true);
        assert!(coordinator.refresh().await.is_err());
        assert!(coordinator.refresh().await.is_err());
        assert!(!coordinator.last_update_success());

        cluster.set_unreachable(false);
        coordinator.refresh().await.unwrap();
        assert!(coordinator.last_update_success());
        assert!(coordinator.last_error().is_none());
    }

    #[tokio::test]
    async fn test_empty_cluster_is_a_valid_snapshot() {
        let cluster = Arc::new(MockCluster::new());
        let coordinator = coordinator(&cluster);

        let RefreshOutcome::Published(snapshot) = coordinator.refresh().await.unwrap() else {
            panic!("expected a published snapshot");
        };
        assert!(snapshot.nodes.is_empty());
        assert!(coordinator.last_update_success());
    }

    #[tokio::test]
    async fn test_overlapping_triggers_run_one_cycle() {
        let cluster = five_node_cluster();
        cluster.set_read_latency(Some(Duration::from_millis(20)));
        let coordinator = coordinator(&cluster);

        let (first, second) = tokio::join!(coordinator.refresh(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(coordinator.state(), CoordinatorState::Refreshing);
            coordinator.refresh().await
        });

        assert!(matches!(first.unwrap(), RefreshOutcome::Published(_)));
        assert!(matches!(second.unwrap(), RefreshOutcome::Skipped));
        assert_eq!(cluster.logins().len(), 1);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_deadline_abandons_cycle() {
        let cluster = five_node_cluster();
        cluster.set_read_latency(Some(Duration::from_millis(50)));
        let coordinator = coordinator(&cluster).with_deadline(Duration::from_millis(120));

        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(
            err.cause,
            RefreshCause::DeadlineExceeded(Duration::from_millis(120))
        );
        assert!(coordinator.snapshot().is_none());
        assert!(!coordinator.last_update_success());
    }

    #[tokio::test]
    async fn test_session_rebuilt_every_cycle() {
        let cluster = five_node_cluster();
        let coordinator = coordinator(&cluster);

        coordinator.refresh().await.unwrap();
        coordinator.refresh().await.unwrap();
        assert_eq!(cluster.logins(), vec!["root@pam", "root@pam"]);
    }

    #[tokio::test]
    async fn test_subscribers_see_published_snapshots() {
        let cluster = five_node_cluster();
        let coordinator = coordinator(&cluster);
        let mut rx = coordinator.subscribe();

        coordinator.refresh().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().nodes.len(), 5);
    }

    #[tokio::test]
    async fn test_actions_run_alongside_refresh() {
        let cluster = five_node_cluster();
        let coordinator = coordinator(&cluster);
        coordinator.refresh().await.unwrap();

        cluster.set_read_latency(Some(Duration::from_millis(20)));
        let (refresh, action) = tokio::join!(
            coordinator.refresh(),
            coordinator.client().vm_action(VmAction::Stop, "pve1", 100)
        );
        assert!(refresh.is_ok());
        assert!(action.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_refreshes_on_interval_and_request() {
        let cluster = five_node_cluster();
        let coordinator = Arc::new(coordinator(&cluster));

        let runner = coordinator.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cluster.logins().len(), 1);

        assert!(coordinator.request_refresh());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cluster.logins().len(), 2);

        handle.abort();
    }

    #[test]
    fn test_debug_omits_credentials() {
        let cluster = Arc::new(MockCluster::new());
        let rendered = format!("{:?}", coordinator(&cluster));

        assert!(rendered.contains("10.0.0.5:8006"));
        assert!(rendered.contains("Idle"));
        assert!(!rendered.contains("secret"));
    }
}
