//! Cluster snapshot assembled by one refresh cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use proxmoxve_client::{ApiItem, ProxmoxError};

/// A node with its VMs and storage volumes.
///
/// Every field the API reports for the node is kept in `attributes`; VM and
/// storage items are passed through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node name, from the item's `node` field
    pub node: String,
    #[serde(flatten)]
    pub attributes: ApiItem,
    pub vms: Vec<ApiItem>,
    pub storage: Vec<ApiItem>,
}

impl NodeRecord {
    /// Build a record from a `/nodes` item. VMs and storage start empty.
    pub fn from_item(mut item: ApiItem) -> Result<Self, ProxmoxError> {
        let node = match item.remove("node") {
            Some(serde_json::Value::String(name)) if !name.is_empty() => name,
            other => {
                return Err(ProxmoxError::InvalidResponse(format!(
                    "node item without a name: {:?}",
                    other
                )))
            }
        };
        // nested lists are owned by the record, never by the raw item
        item.remove("vms");
        item.remove("storage");

        Ok(Self {
            node,
            attributes: item,
            vms: Vec::new(),
            storage: Vec::new(),
        })
    }

    /// A string attribute reported by the API, e.g. `status`.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// The published cluster state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub refreshed_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self {
            nodes,
            refreshed_at: Utc::now(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node == name)
    }

    pub fn vm_count(&self) -> usize {
        self.nodes.iter().map(|n| n.vms.len()).sum()
    }

    pub fn storage_count(&self) -> usize {
        self.nodes.iter().map(|n| n.storage.len()).sum()
    }
}
