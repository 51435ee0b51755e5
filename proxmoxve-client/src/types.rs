//! Request paths and action definitions for the Proxmox VE API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProxmoxError;

/// An item returned by a list endpoint, passed through unmodified.
pub type ApiItem = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// PATHS
// =============================================================================

/// Whether `name` can be used as a node path segment.
///
/// Node names are host names: ASCII letters, digits, `.`, `-` and `_`, and
/// never `.` or `..`.
pub fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}

/// `GET` path listing cluster nodes.
pub fn nodes_path() -> String {
    "/nodes".to_string()
}

/// `GET` path listing the QEMU VMs of a node.
pub fn node_vms_path(node: &str) -> String {
    format!("/nodes/{}/qemu", node)
}

/// `GET` path listing the storage volumes of a node.
pub fn node_storage_path(node: &str) -> String {
    format!("/nodes/{}/storage", node)
}

// =============================================================================
// VM ACTIONS
// =============================================================================

/// A VM state transition exposed as a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    Start,
    Stop,
    Reboot,
    Shutdown,
    Hibernate,
    Pause,
    Reset,
}

impl VmAction {
    pub const ALL: [VmAction; 7] = [
        VmAction::Start,
        VmAction::Stop,
        VmAction::Reboot,
        VmAction::Shutdown,
        VmAction::Hibernate,
        VmAction::Pause,
        VmAction::Reset,
    ];

    /// Last segment of the remote status endpoint.
    pub fn verb(self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Reboot => "reboot",
            VmAction::Shutdown => "shutdown",
            // suspend-to-disk is the remote's `suspend` verb
            VmAction::Hibernate => "suspend",
            VmAction::Pause => "pause",
            VmAction::Reset => "reset",
        }
    }

    /// Name under which the action is registered as a service.
    pub fn service_name(self) -> &'static str {
        match self {
            VmAction::Start => "start_vm",
            VmAction::Stop => "stop_vm",
            VmAction::Reboot => "reboot_vm",
            VmAction::Shutdown => "shutdown_vm",
            VmAction::Hibernate => "hibernate_vm",
            VmAction::Pause => "pause_vm",
            VmAction::Reset => "reset_vm",
        }
    }

    /// Look up an action by its service name.
    pub fn from_service_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.service_name() == name)
    }

    /// `POST` path performing the transition.
    pub fn path(self, node: &str, vm_id: u32) -> String {
        format!("/nodes/{}/qemu/{}/status/{}", node, vm_id, self.verb())
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

impl FromStr for VmAction {
    type Err = ProxmoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_service_name(s)
            .ok_or_else(|| ProxmoxError::Internal(format!("Unknown VM action: {}", s)))
    }
}
