//! Core abstraction traits for reaching the Proxmox VE API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConnectionConfig;
use crate::error::{ProxmoxError, Result};
use crate::types::{node_storage_path, node_vms_path, nodes_path, ApiItem, VmAction};

/// An authenticated session against the API.
///
/// Backends implement the two raw verbs; the typed calls are provided on top
/// of them so every backend addresses the same paths. Paths are relative to
/// the JSON API root (`/nodes`, not `/api2/json/nodes`) and results are the
/// unwrapped `data` member of the response.
#[async_trait]
pub trait ApiSession: Send + Sync {
    /// Issue a read.
    async fn get(&self, path: &str) -> Result<Value>;

    /// Issue a write without parameters.
    async fn post(&self, path: &str) -> Result<Value>;

    // =========================================================================
    // Typed reads
    // =========================================================================

    /// List cluster nodes.
    async fn list_nodes(&self) -> Result<Vec<ApiItem>> {
        let path = nodes_path();
        into_items(&path, self.get(&path).await?)
    }

    /// List the QEMU VMs of a node.
    async fn list_vms(&self, node: &str) -> Result<Vec<ApiItem>> {
        let path = node_vms_path(node);
        into_items(&path, self.get(&path).await?)
    }

    /// List the storage volumes of a node.
    async fn list_storage(&self, node: &str) -> Result<Vec<ApiItem>> {
        let path = node_storage_path(node);
        into_items(&path, self.get(&path).await?)
    }

    // =========================================================================
    // VM control
    // =========================================================================

    /// Request a VM state transition, returning the remote result verbatim.
    async fn send_vm_action(&self, node: &str, vm_id: u32, action: VmAction) -> Result<Value> {
        self.post(&action.path(node, vm_id)).await
    }
}

/// Produces authenticated sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticate as `user_id` and return a fresh session.
    async fn connect(&self, config: &ConnectionConfig, user_id: &str) -> Result<Arc<dyn ApiSession>>;
}

/// Interpret a list response as a sequence of objects.
fn into_items(path: &str, data: Value) -> Result<Vec<ApiItem>> {
    match data {
        Value::Array(values) => values
            .into_iter()
            .map(|v| match v {
                Value::Object(map) => Ok(map),
                other => Err(ProxmoxError::InvalidResponse(format!(
                    "{}: expected object items, got {}",
                    path, other
                ))),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(ProxmoxError::InvalidResponse(format!(
            "{}: expected a list, got {}",
            path, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_items_accepts_objects() {
        let items = into_items("/nodes", json!([{"node": "a"}, {"node": "b"}])).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["node"], "b");
    }

    #[test]
    fn test_into_items_null_is_empty() {
        assert!(into_items("/nodes", Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_into_items_rejects_scalars() {
        let err = into_items("/nodes", json!("nope")).unwrap_err();
        assert_eq!(err.kind(), "invalid_response");

        let err = into_items("/nodes", json!([1, 2])).unwrap_err();
        assert_eq!(err.kind(), "invalid_response");
    }
}
