//! Session client: connection parameters plus the current session handle.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::error::{ProxmoxError, Result};
use crate::traits::{ApiSession, Connector};
use crate::types::VmAction;

/// Holds connection parameters and the most recently built session.
///
/// The session is rebuilt from scratch on every [`SessionClient::build_session`]
/// call; there is no keep-alive or validity check of an existing session.
/// VM actions read the current handle and issue exactly one remote call each.
pub struct SessionClient {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Arc<dyn ApiSession>>>,
}

impl SessionClient {
    /// Create a client. Performs no I/O.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            session: RwLock::new(None),
        }
    }

    /// Create a client from individual connection fields. Performs no I/O.
    ///
    /// `verify_tls` is honoured as named: `true` verifies the server certificate.
    pub fn configure(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        realm: impl Into<String>,
        password: impl Into<String>,
        verify_tls: bool,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::new(
            ConnectionConfig::new(host, port, username, realm, password, verify_tls),
            connector,
        )
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Authenticate again and replace the current session.
    ///
    /// When authentication fails the previous session is dropped as well, so
    /// later calls see [`ProxmoxError::SessionNotBuilt`] instead of a stale handle.
    #[instrument(skip(self), fields(endpoint = %self.config.endpoint()))]
    pub async fn build_session(&self) -> Result<Arc<dyn ApiSession>> {
        let user_id = self.config.user_id();
        debug!(user = %user_id, "Building API session");

        match self.connector.connect(&self.config, &user_id).await {
            Ok(session) => {
                *self.write_slot()? = Some(session.clone());
                debug!(user = %user_id, "API session established");
                Ok(session)
            }
            Err(e) => {
                *self.write_slot()? = None;
                warn!(user = %user_id, error = %e, "Failed to build API session");
                Err(e)
            }
        }
    }

    /// The most recently built session.
    pub fn current_session(&self) -> Result<Arc<dyn ApiSession>> {
        self.session
            .read()
            .map_err(|_| ProxmoxError::Internal("Lock poisoned".to_string()))?
            .clone()
            .ok_or(ProxmoxError::SessionNotBuilt)
    }

    /// Whether a session has been built.
    pub fn has_session(&self) -> bool {
        self.current_session().is_ok()
    }

    fn write_slot(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, Option<Arc<dyn ApiSession>>>> {
        self.session
            .write()
            .map_err(|_| ProxmoxError::Internal("Lock poisoned".to_string()))
    }

    // =========================================================================
    // VM actions
    // =========================================================================

    /// Dispatch `action` for `vm_id` on `node` through the current session.
    ///
    /// Whether the node or VM exists is left to the remote endpoint.
    #[instrument(skip(self), fields(endpoint = %self.config.endpoint()))]
    pub async fn vm_action(&self, action: VmAction, node: &str, vm_id: u32) -> Result<Value> {
        let session = self.current_session()?;
        info!(node = %node, vm_id, action = %action, "Dispatching VM action");
        session.send_vm_action(node, vm_id, action).await
    }

    pub async fn start_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Start, node, vm_id).await
    }

    pub async fn stop_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Stop, node, vm_id).await
    }

    pub async fn reboot_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Reboot, node, vm_id).await
    }

    pub async fn shutdown_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Shutdown, node, vm_id).await
    }

    pub async fn hibernate_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Hibernate, node, vm_id).await
    }

    pub async fn pause_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Pause, node, vm_id).await
    }

    pub async fn reset_vm(&self, node: &str, vm_id: u32) -> Result<Value> {
        self.vm_action(VmAction::Reset, node, vm_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, MockConnector};
    use serde_json::json;

    fn cluster() -> Arc<MockCluster> {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_node(
            json!({"node": "pve1", "status": "online"}),
            vec![json!({"vmid": 100, "name": "web", "status": "stopped"})],
            vec![],
        );
        cluster
    }

    fn client(cluster: &Arc<MockCluster>, username: &str) -> SessionClient {
        SessionClient::configure(
            "10.0.0.5",
            8006,
            username,
            "pve",
            "secret",
            true,
            Arc::new(MockConnector::new(cluster.clone())),
        )
    }

    #[test]
    fn test_configure_keeps_tls_flag() {
        let cluster = cluster();
        assert!(client(&cluster, "root").config().verify_tls);
    }

    #[test]
    fn test_current_session_before_build() {
        let cluster = cluster();
        let client = client(&cluster, "root");
        assert_eq!(client.current_session().err(), Some(ProxmoxError::SessionNotBuilt));
        assert!(!client.has_session());
    }

    #[tokio::test]
    async fn test_build_session_appends_realm() {
        let cluster = cluster();
        client(&cluster, "monitor").build_session().await.unwrap();
        client(&cluster, "root@pam").build_session().await.unwrap();

        assert_eq!(cluster.logins(), vec!["monitor@pve".to_string(), "root@pam".to_string()]);
    }

    #[tokio::test]
    async fn test_build_session_replaces_previous() {
        let cluster = cluster();
        let client = client(&cluster, "root");

        let first = client.build_session().await.unwrap();
        let second = client.build_session().await.unwrap();
        let current = client.current_session().unwrap();

        assert!(!Arc::ptr_eq(&first, &current));
        assert!(Arc::ptr_eq(&second, &current));
        assert_eq!(cluster.logins().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_build_drops_session() {
        let cluster = cluster();
        let client = client(&cluster, "root");
        client.build_session().await.unwrap();

        cluster.reject_credentials(true);
        let err = client.build_session().await.err().unwrap();
        assert_eq!(err.kind(), "authentication");
        assert!(!client.has_session());
    }

    #[tokio::test]
    async fn test_action_without_session() {
        let cluster = cluster();
        let client = client(&cluster, "root");

        let err = client.start_vm("pve1", 100).await.unwrap_err();
        assert_eq!(err, ProxmoxError::SessionNotBuilt);
        assert!(cluster.posts().is_empty());
    }

    #[tokio::test]
    async fn test_each_action_hits_its_endpoint_once() {
        let cluster = cluster();
        let client = client(&cluster, "root");
        client.build_session().await.unwrap();

        let results = vec![
            client.start_vm("pve1", 100).await.unwrap(),
            client.stop_vm("pve1", 100).await.unwrap(),
            client.reboot_vm("pve1", 100).await.unwrap(),
            client.shutdown_vm("pve1", 100).await.unwrap(),
            client.hibernate_vm("pve1", 100).await.unwrap(),
            client.pause_vm("pve1", 100).await.unwrap(),
            client.reset_vm("pve1", 100).await.unwrap(),
        ];

        assert_eq!(
            cluster.posts(),
            vec![
                "/nodes/pve1/qemu/100/status/start",
                "/nodes/pve1/qemu/100/status/stop",
                "/nodes/pve1/qemu/100/status/reboot",
                "/nodes/pve1/qemu/100/status/shutdown",
                "/nodes/pve1/qemu/100/status/suspend",
                "/nodes/pve1/qemu/100/status/pause",
                "/nodes/pve1/qemu/100/status/reset",
            ]
        );
        for (result, action) in results.iter().zip(VmAction::ALL) {
            assert_eq!(result, &cluster.action_response("pve1", 100, action));
        }
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_found() {
        let cluster = cluster();
        let client = client(&cluster, "root");
        client.build_session().await.unwrap();

        let err = client.start_vm("pve1", 999).await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");
        let err = client.start_vm("pve9", 100).await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");
    }
}
