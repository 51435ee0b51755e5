//! Entity views derived from a coordinator's snapshot.
//!
//! An entity is a coordinator plus an identity. Sensors are the display
//! components fed from the snapshot: one status sensor per node and per VM,
//! and one usage sensor per storage volume.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use proxmoxve_client::ApiItem;

use crate::coordinator::RefreshCoordinator;
use crate::snapshot::ClusterSnapshot;

/// Integration domain, used in device identifiers.
pub const DOMAIN: &str = "proxmoxve";

/// Device descriptor grouping an entry's entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: String,
    pub sw_version: String,
}

/// An entity bound to a coordinator.
pub struct ProxmoxEntity {
    device_id: Option<String>,
    name: String,
    coordinator: Arc<RefreshCoordinator>,
}

impl ProxmoxEntity {
    pub fn new(device_id: Option<String>, name: impl Into<String>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            device_id,
            name: name.into(),
            coordinator,
        }
    }

    fn host(&self) -> &str {
        &self.coordinator.client().config().host
    }

    /// `{host}-{device_id}`; entities without a device id use their name.
    pub fn unique_id(&self) -> String {
        let suffix = self.device_id.clone().unwrap_or_else(|| slug(&self.name));
        format!("{}-{}", self.host(), suffix)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device descriptor, present only for entities with a device id.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_id.as_ref()?;

        let host = self.host().to_string();
        Some(DeviceInfo {
            identifiers: vec![(DOMAIN.to_string(), host.clone())],
            name: format!("Proxmox Server ({})", host),
            manufacturer: "Proxmox VE".to_string(),
            sw_version: String::new(),
        })
    }

    /// Data is fresh: the last cycle succeeded and a snapshot exists.
    pub fn available(&self) -> bool {
        self.coordinator.last_update_success() && self.coordinator.snapshot().is_some()
    }
}

fn slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// A sensor value with its attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub unique_id: String,
    pub name: String,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    pub attributes: ApiItem,
}

/// Build every sensor from the coordinator's latest snapshot.
///
/// During a failure streak the last snapshot is still reported, with
/// `available` set to false.
pub fn sensors(coordinator: &Arc<RefreshCoordinator>) -> Vec<SensorReading> {
    match coordinator.snapshot() {
        Some(snapshot) => sensors_from(coordinator, &snapshot),
        None => Vec::new(),
    }
}

fn sensors_from(coordinator: &Arc<RefreshCoordinator>, snapshot: &ClusterSnapshot) -> Vec<SensorReading> {
    let mut readings = Vec::new();

    let reading = |device_id: String, name: String, state: Value, unit, attributes: ApiItem| {
        let entity = ProxmoxEntity::new(Some(device_id), name, coordinator.clone());
        SensorReading {
            unique_id: entity.unique_id(),
            name: entity.name().to_string(),
            state,
            unit,
            available: entity.available(),
            device: entity.device_info(),
            attributes,
        }
    };

    for node in &snapshot.nodes {
        readings.push(reading(
            format!("node-{}", node.node),
            format!("{} Status", node.node),
            node.attributes.get("status").cloned().unwrap_or(Value::Null),
            None,
            node.attributes.clone(),
        ));

        for vm in &node.vms {
            let vmid = vm.get("vmid").cloned().unwrap_or(Value::Null);
            let label = vm
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| vmid.to_string());
            readings.push(reading(
                format!("vm-{}-{}", node.node, vmid),
                format!("{} Status", label),
                vm.get("status").cloned().unwrap_or(Value::Null),
                None,
                vm.clone(),
            ));
        }

        for volume in &node.storage {
            let storage = volume.get("storage").and_then(Value::as_str).unwrap_or("unknown");
            readings.push(reading(
                format!("storage-{}-{}", node.node, storage),
                format!("{} {} Usage", node.node, storage),
                usage_percent(volume).map(Value::from).unwrap_or(Value::Null),
                Some("%"),
                volume.clone(),
            ));
        }
    }

    readings
}

/// Used space as a percentage of total, rounded to one decimal.
fn usage_percent(volume: &ApiItem) -> Option<f64> {
    let used = volume.get("used").and_then(Value::as_f64)?;
    let total = volume.get("total").and_then(Value::as_f64)?;
    if total <= 0.0 {
        return None;
    }
    Some((used / total * 1000.0).round() / 10.0)
}
