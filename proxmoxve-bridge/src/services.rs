//! VM action services.
//!
//! Each loaded entry registers the seven VM actions under its entry id. A call
//! carries a JSON payload that must be exactly `{vm_id, node_name}`; payloads
//! are validated before anything reaches the network.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use proxmoxve_client::{is_valid_node_name, ProxmoxError, SessionClient, VmAction};

/// Errors returned by a service call.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The payload failed validation; no remote call was made.
    #[error("Invalid service data: {0}")]
    InvalidRequest(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("No services registered for entry: {0}")]
    UnknownEntry(String),

    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] ProxmoxError),
}

/// Validated payload of a VM action call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmActionRequest {
    pub vm_id: u32,
    pub node_name: String,
}

impl VmActionRequest {
    /// Validate a raw payload.
    ///
    /// `vm_id` may be a JSON integer or a string holding one; `node_name` must
    /// be a host-name shaped string. Any other key is rejected.
    pub fn from_payload(payload: &Value) -> Result<Self, ServiceError> {
        let map = payload.as_object().ok_or_else(|| {
            ServiceError::InvalidRequest("expected an object with vm_id and node_name".to_string())
        })?;

        if let Some(extra) = map.keys().find(|k| *k != "vm_id" && *k != "node_name") {
            return Err(ServiceError::InvalidRequest(format!(
                "extra keys not allowed @ data['{}']",
                extra
            )));
        }

        let vm_id = match map.get("vm_id") {
            None => {
                return Err(ServiceError::InvalidRequest(
                    "required key not provided @ data['vm_id']".to_string(),
                ))
            }
            Some(value) => coerce_vm_id(value)?,
        };

        let node_name = match map.get("node_name") {
            Some(Value::String(name)) if is_valid_node_name(name) => name.clone(),
            Some(Value::String(name)) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "invalid node name '{}' @ data['node_name']",
                    name
                )))
            }
            Some(_) => {
                return Err(ServiceError::InvalidRequest(
                    "expected str for dictionary value @ data['node_name']".to_string(),
                ))
            }
            None => {
                return Err(ServiceError::InvalidRequest(
                    "required key not provided @ data['node_name']".to_string(),
                ))
            }
        };

        Ok(Self { vm_id, node_name })
    }
}

fn coerce_vm_id(value: &Value) -> Result<u32, ServiceError> {
    let invalid = || {
        ServiceError::InvalidRequest(format!(
            "expected int for dictionary value @ data['vm_id'], got {}",
            value
        ))
    };

    let id = match value {
        Value::Number(n) => n.as_u64().ok_or_else(invalid)?,
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    u32::try_from(id).map_err(|_| invalid())
}

/// A registered service bound to the session client it dispatches through.
#[derive(Clone)]
struct ServiceHandler {
    action: VmAction,
    client: Arc<SessionClient>,
}

/// Services of every loaded entry, keyed by entry id then service name.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, HashMap<&'static str, ServiceHandler>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the seven VM actions for `entry_id`, replacing any previous set.
    pub fn register_vm_actions(&self, entry_id: &str, client: Arc<SessionClient>) {
        let handlers = VmAction::ALL
            .into_iter()
            .map(|action| {
                (
                    action.service_name(),
                    ServiceHandler {
                        action,
                        client: client.clone(),
                    },
                )
            })
            .collect();

        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry_id.to_string(), handlers);
        info!(entry_id = %entry_id, count = VmAction::ALL.len(), "Registered VM action services");
    }

    /// Remove every service of `entry_id`. Returns whether any were registered.
    pub fn unregister(&self, entry_id: &str) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entry_id)
            .is_some();
        if removed {
            debug!(entry_id = %entry_id, "Unregistered VM action services");
        }
        removed
    }

    /// Names of the services registered for `entry_id`, sorted.
    pub fn services(&self, entry_id: &str) -> Vec<&'static str> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&'static str> = entries
            .get(entry_id)
            .map(|handlers| handlers.keys().copied().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Validate `payload` and dispatch `service` for `entry_id`.
    pub async fn call(
        &self,
        entry_id: &str,
        service: &str,
        payload: &Value,
    ) -> Result<Value, ServiceError> {
        let handler = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            let handlers = entries
                .get(entry_id)
                .ok_or_else(|| ServiceError::UnknownEntry(entry_id.to_string()))?;
            handlers
                .get(service)
                .cloned()
                .ok_or_else(|| ServiceError::UnknownService(service.to_string()))?
        };

        let request = VmActionRequest::from_payload(payload).map_err(|e| {
            warn!(entry_id = %entry_id, service = %service, error = %e, "Rejected service call");
            e
        })?;

        let result = handler
            .client
            .vm_action(handler.action, &request.node_name, request.vm_id)
            .await?;
        Ok(result)
    }
}
