//! Entry lifecycle tests against a simulated cluster.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use proxmoxve_bridge::config::{EntryConfig, EntryOptions};
use proxmoxve_bridge::coordinator::RefreshCause;
use proxmoxve_bridge::entry::{EntryRegistry, SetupError};
use proxmoxve_bridge::services::ServiceError;
use proxmoxve_client::{MockCluster, MockConnector, ProxmoxError};

fn entry(id: &str, interval_secs: u64) -> EntryConfig {
    EntryConfig {
        id: id.to_string(),
        serverip: "192.168.1.10".to_string(),
        serverport: 8006,
        username: "root".to_string(),
        password: "secret".to_string(),
        realm: "pam".to_string(),
        verify_tls: true,
        options: EntryOptions {
            update_interval_secs: interval_secs,
        },
    }
}

fn setup() -> (EntryRegistry, Arc<MockCluster>) {
    let cluster = Arc::new(MockCluster::demo());
    let registry = EntryRegistry::new(Arc::new(MockConnector::new(cluster.clone())))
        .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(40));
    (registry, cluster)
}

/// Wait until the entry's background retries have made it ready.
async fn wait_ready(registry: &EntryRegistry, id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.is_ready(id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("entry did not become ready");
}

#[tokio::test]
async fn test_setup_fails_when_initial_refresh_fails() {
    let (registry, cluster) = setup();
    cluster.set_unreachable(true);

    let err = registry.setup_entry(entry("lab", 60)).await.unwrap_err();
    match err {
        SetupError::NotReady { id, source } => {
            assert_eq!(id, "lab");
            assert!(matches!(source.cause, RefreshCause::Remote(ProxmoxError::Connectivity(_))));
        }
        other => panic!("unexpected error: {other}"),
    }

    // activation aborted: no services, but the entry is kept for retry
    assert!(registry.is_loaded("lab").await);
    assert!(!registry.is_ready("lab").await);
    assert!(registry.services().services("lab").is_empty());

    cluster.set_unreachable(false);
    wait_ready(&registry, "lab").await;
    assert_eq!(registry.services().services("lab").len(), 7);
    assert!(registry.coordinator("lab").await.unwrap().snapshot().is_some());
}

#[tokio::test]
async fn test_setup_fails_on_rejected_credentials() {
    let (registry, cluster) = setup();
    cluster.reject_credentials(true);

    let err = registry.setup_entry(entry("lab", 60)).await.unwrap_err();
    assert!(matches!(
        err,
        SetupError::NotReady { source, .. }
            if matches!(source.cause, RefreshCause::Remote(ProxmoxError::Authentication { .. }))
    ));
}

#[tokio::test]
async fn test_options_change_replaces_coordinator() {
    let (registry, cluster) = setup();
    let first = registry.setup_entry(entry("lab", 60)).await.unwrap();
    assert_eq!(cluster.logins().len(), 1);

    let second = registry
        .update_options("lab", EntryOptions { update_interval_secs: 5 })
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.update_interval(), Duration::from_secs(5));
    assert_eq!(cluster.logins().len(), 2);

    let current = registry.coordinator("lab").await.unwrap();
    assert!(Arc::ptr_eq(&current, &second));
    assert_eq!(
        registry.entry_config("lab").await.unwrap().options.update_interval_secs,
        5
    );
}

#[tokio::test]
async fn test_options_change_rejects_zero_interval() {
    let (registry, _) = setup();
    let first = registry.setup_entry(entry("lab", 60)).await.unwrap();

    let err = registry
        .update_options("lab", EntryOptions { update_interval_secs: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::InvalidConfig(_)));

    let current = registry.coordinator("lab").await.unwrap();
    assert!(Arc::ptr_eq(&current, &first));
}

#[tokio::test]
async fn test_options_change_during_outage_recovers() {
    let (registry, cluster) = setup();
    registry.setup_entry(entry("lab", 60)).await.unwrap();

    cluster.set_unreachable(true);
    let err = registry
        .update_options("lab", EntryOptions { update_interval_secs: 30 })
        .await
        .unwrap_err();
    assert!(matches!(err, SetupError::NotReady { .. }));
    assert!(!registry.is_ready("lab").await);
    assert!(registry.services().services("lab").is_empty());
    assert_eq!(
        registry.entry_config("lab").await.unwrap().options.update_interval_secs,
        30
    );

    cluster.set_unreachable(false);
    wait_ready(&registry, "lab").await;

    let coordinator = registry.coordinator("lab").await.unwrap();
    assert_eq!(coordinator.update_interval(), Duration::from_secs(30));
    assert!(coordinator.last_update_success());

    let payload = json!({"vm_id": 100, "node_name": "pve1"});
    registry.call_service("lab", "stop_vm", &payload).await.unwrap();
}

#[tokio::test]
async fn test_reload_not_ready_entry() {
    let (registry, cluster) = setup();
    cluster.set_unreachable(true);
    assert!(registry.setup_entry(entry("lab", 60)).await.is_err());

    cluster.set_unreachable(false);
    let coordinator = registry.reload_entry("lab").await.unwrap();
    assert!(coordinator.last_update_success());
    assert!(registry.is_ready("lab").await);
}

#[tokio::test]
async fn test_unload_stops_retrying() {
    let (registry, cluster) = setup();
    cluster.set_unreachable(true);
    assert!(registry.setup_entry(entry("lab", 60)).await.is_err());

    registry.unload_entry("lab").await.unwrap();
    let attempts = cluster.logins().len();

    cluster.set_unreachable(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.logins().len(), attempts);
    assert!(!registry.is_loaded("lab").await);
    assert!(registry.services().services("lab").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_entries_set_up_concurrently() {
    let (registry, cluster) = setup();
    // 5 reads per cycle on the demo cluster
    cluster.set_read_latency(Some(Duration::from_secs(1)));

    let started = tokio::time::Instant::now();
    let (a, b) = tokio::join!(
        registry.setup_entry(entry("a", 60)),
        registry.setup_entry(entry("b", 60)),
    );
    a.unwrap();
    b.unwrap();

    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn test_services_follow_entry_lifecycle() {
    let (registry, cluster) = setup();
    registry.setup_entry(entry("lab", 60)).await.unwrap();

    let payload = json!({"vm_id": 101, "node_name": "pve1"});
    registry.call_service("lab", "start_vm", &payload).await.unwrap();
    assert_eq!(cluster.posts(), vec!["/nodes/pve1/qemu/101/status/start"]);

    registry
        .call_service("lab", "hibernate_vm", &payload)
        .await
        .unwrap();
    assert_eq!(cluster.posts()[1], "/nodes/pve1/qemu/101/status/suspend");

    registry.unload_entry("lab").await.unwrap();
    assert!(matches!(
        registry.call_service("lab", "start_vm", &payload).await,
        Err(ServiceError::UnknownEntry(_))
    ));
}

#[tokio::test]
async fn test_entries_are_independent() {
    let (registry, cluster) = setup();
    registry.setup_entry(entry("a", 60)).await.unwrap();
    registry.setup_entry(entry("b", 120)).await.unwrap();

    registry.unload_entry("a").await.unwrap();

    assert!(registry.coordinator("a").await.is_none());
    let b = registry.coordinator("b").await.unwrap();
    assert_eq!(b.update_interval(), Duration::from_secs(120));
    assert_eq!(registry.services().services("b").len(), 7);
    assert_eq!(cluster.logins().len(), 2);
}
