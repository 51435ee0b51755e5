//! Mock Proxmox VE backend for testing and development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{ProxmoxError, Result};
use crate::traits::{ApiSession, Connector};
use crate::types::{node_storage_path, node_vms_path, nodes_path, VmAction};

/// In-memory cluster served by [`MockConnector`] sessions.
///
/// Records every login, read and write so tests can assert on the exact
/// remote traffic. Failures can be injected per path, and a fixed latency can
/// be added to reads to hold a refresh cycle open.
pub struct MockCluster {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    nodes: Vec<MockNode>,
    reject_credentials: bool,
    unreachable: bool,
    read_latency: Option<Duration>,
    failing_reads: HashMap<String, ProxmoxError>,
    logins: Vec<String>,
    reads: Vec<String>,
    posts: Vec<String>,
}

struct MockNode {
    name: String,
    item: Value,
    vms: Vec<Value>,
    storage: Vec<Value>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// A small two-node cluster, used by the daemon's development mode.
    pub fn demo() -> Self {
        let cluster = Self::new();
        cluster.add_node(
            serde_json::json!({"node": "pve1", "status": "online", "cpu": 0.05, "maxcpu": 8}),
            vec![
                serde_json::json!({"vmid": 100, "name": "gateway", "status": "running"}),
                serde_json::json!({"vmid": 101, "name": "media", "status": "stopped"}),
            ],
            vec![
                serde_json::json!({"storage": "local", "type": "dir", "total": 100_000_000_000u64, "used": 25_000_000_000u64}),
                serde_json::json!({"storage": "local-lvm", "type": "lvmthin", "total": 400_000_000_000u64, "used": 120_000_000_000u64}),
            ],
        );
        cluster.add_node(
            serde_json::json!({"node": "pve2", "status": "online", "cpu": 0.12, "maxcpu": 16}),
            vec![serde_json::json!({"vmid": 200, "name": "builder", "status": "running"})],
            vec![serde_json::json!({"storage": "local", "type": "dir", "total": 100_000_000_000u64, "used": 60_000_000_000u64})],
        );
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not hide the recorded calls
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a node with its VMs and storage. `item` must carry a `node` field.
    pub fn add_node(&self, item: Value, vms: Vec<Value>, storage: Vec<Value>) {
        let name = item
            .get("node")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.lock().nodes.push(MockNode { name, item, vms, storage });
    }

    /// Remove a node from the cluster.
    pub fn remove_node(&self, name: &str) {
        self.lock().nodes.retain(|n| n.name != name);
    }

    /// Make logins fail with an authentication error.
    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    /// Make logins fail with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Delay every read by `latency`.
    pub fn set_read_latency(&self, latency: Option<Duration>) {
        self.lock().read_latency = latency;
    }

    /// Make reads of `path` fail with `error`.
    pub fn fail_read(&self, path: impl Into<String>, error: ProxmoxError) {
        self.lock().failing_reads.insert(path.into(), error);
    }

    /// Clear all injected read failures.
    pub fn clear_failures(&self) {
        self.lock().failing_reads.clear();
    }

    /// User identifiers of every login attempt, in order.
    pub fn logins(&self) -> Vec<String> {
        self.lock().logins.clone()
    }

    /// Paths of every read, in order.
    pub fn reads(&self) -> Vec<String> {
        self.lock().reads.clone()
    }

    /// Paths of every write, in order.
    pub fn posts(&self) -> Vec<String> {
        self.lock().posts.clone()
    }

    /// The value returned for a successful action.
    pub fn action_response(&self, node: &str, vm_id: u32, action: VmAction) -> Value {
        Value::String(format!("UPID:{}:qm{}:{}:", node, action.verb(), vm_id))
    }

    fn read(&self, path: &str) -> Result<Value> {
        let mut state = self.lock();
        state.reads.push(path.to_string());

        if let Some(e) = state.failing_reads.get(path) {
            return Err(e.clone());
        }

        if path == nodes_path() {
            return Ok(Value::Array(state.nodes.iter().map(|n| n.item.clone()).collect()));
        }

        for node in &state.nodes {
            if path == node_vms_path(&node.name) {
                return Ok(Value::Array(node.vms.clone()));
            }
            if path == node_storage_path(&node.name) {
                return Ok(Value::Array(node.storage.clone()));
            }
        }

        Err(ProxmoxError::ResourceNotFound(path.to_string()))
    }

    fn write(&self, path: &str) -> Result<Value> {
        let mut state = self.lock();
        state.posts.push(path.to_string());

        for node in state.nodes.iter_mut() {
            for action in VmAction::ALL {
                for vm in node.vms.iter_mut() {
                    let Some(vm_id) = vm.get("vmid").and_then(Value::as_u64) else {
                        continue;
                    };
                    let Ok(vm_id) = u32::try_from(vm_id) else {
                        continue;
                    };
                    if action.path(&node.name, vm_id) != path {
                        continue;
                    }

                    vm["status"] = Value::String(status_after(action).to_string());
                    info!(node = %node.name, vm_id, action = %action, "Mock VM action applied");
                    return Ok(self.action_response(&node.name, vm_id, action));
                }
            }
        }

        Err(ProxmoxError::ResourceNotFound(path.to_string()))
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn status_after(action: VmAction) -> &'static str {
    match action {
        VmAction::Start | VmAction::Reboot | VmAction::Reset => "running",
        VmAction::Stop | VmAction::Shutdown | VmAction::Hibernate => "stopped",
        VmAction::Pause => "paused",
    }
}

/// Connector producing sessions against a [`MockCluster`].
pub struct MockConnector {
    cluster: Arc<MockCluster>,
}

impl MockConnector {
    pub fn new(cluster: Arc<MockCluster>) -> Self {
        info!("Creating mock Proxmox VE backend");
        Self { cluster }
    }

    pub fn cluster(&self) -> &Arc<MockCluster> {
        &self.cluster
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ConnectionConfig, user_id: &str) -> Result<Arc<dyn ApiSession>> {
        let mut state = self.cluster.lock();
        state.logins.push(user_id.to_string());

        if state.unreachable {
            return Err(ProxmoxError::Connectivity(format!(
                "{} is unreachable",
                config.endpoint()
            )));
        }
        if state.reject_credentials {
            return Err(ProxmoxError::auth(user_id, "authentication failure"));
        }

        debug!(user = %user_id, "Mock session created");
        Ok(Arc::new(MockSession {
            cluster: self.cluster.clone(),
        }))
    }
}

struct MockSession {
    cluster: Arc<MockCluster>,
}

#[async_trait]
impl ApiSession for MockSession {
    async fn get(&self, path: &str) -> Result<Value> {
        let latency = self.cluster.lock().read_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.cluster.read(path)
    }

    async fn post(&self, path: &str) -> Result<Value> {
        self.cluster.write(path)
    }
}
