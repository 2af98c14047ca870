//! End-to-end pipeline tests.
//!
//! Exercises the scheduler -> executor -> sink flow against a fake probing
//! program, plus the management API round trip from credential creation to
//! provisioning. Subprocess tests are unix-only (shell-script plugins).

#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argus::{
    MemStore, MetricDefinition, Plugin, PollExecutor, PollRequest, ProvisionEvent, Registry,
    Scheduler, SchedulerConfig,
    registry::{CredentialProfile, CredentialSecrets, Device, DeviceType, Protocol},
    sink::{FileSink, RESULT_CAPACITY},
};
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;

// =============================================================================
// Test Helpers
// =============================================================================

/// Write an executable shell script acting as the probing program.
fn fake_plugin(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("plugin.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Registry holding one credential profile and one provisioned device with a
/// single metric at the given interval.
async fn seeded_registry(interval: Duration) -> (Arc<Registry>, u64, u64) {
    let registry = Registry::load(Arc::new(MemStore::new())).await.unwrap();
    let profile = registry
        .insert_credential(CredentialProfile {
            id: 0,
            name: "lab-ssh".to_string(),
            protocol: Protocol::Ssh,
            secrets: CredentialSecrets::Ssh {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
        })
        .await
        .unwrap();
    let device = registry
        .insert_device(Device {
            id: 0,
            profile_id: profile.id,
            ip: "127.0.0.1".to_string(),
            port: 22,
            hostname: Some("edge-1".to_string()),
            device_type: DeviceType::Linux,
        })
        .await
        .unwrap();
    registry
        .insert_metric(MetricDefinition {
            id: 0,
            device_id: device.id,
            group: "Linux.CPU".to_string(),
            interval,
            last_polled: None,
        })
        .await
        .unwrap();
    (Arc::new(registry), device.id, profile.id)
}

/// Poll the archive directory until a file shows up or the budget runs out.
async fn wait_for_archive(dir: &std::path::Path, budget: Duration) -> Option<PathBuf> {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|e| e == "txt") {
                    return Some(entry.path());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

// =============================================================================
// Scheduler -> executor -> sink
// =============================================================================

#[tokio::test]
async fn test_provision_event_drives_poll_to_archive() {
    let plugin_dir = TempDir::new().unwrap();
    let archive_dir = TempDir::new().unwrap();
    let plugin_path = fake_plugin(
        &plugin_dir,
        r#"echo '{"ip":"127.0.0.1","result":{"cpu":12.5}}'"#,
    );

    let (registry, device_id, _profile_id) = seeded_registry(Duration::from_secs(1)).await;

    let (provision_tx, provision_rx) = mpsc::channel(8);
    let (request_tx, request_rx) = mpsc::channel(64);
    let (result_tx, result_rx) = mpsc::channel(RESULT_CAPACITY);

    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        request_tx,
        provision_rx,
        &SchedulerConfig {
            tick: Duration::from_millis(100),
        },
    );
    tokio::spawn(scheduler.run());

    let executor = PollExecutor::new(
        Arc::clone(&registry),
        Plugin::new(&plugin_path),
        result_tx,
        4,
    );
    tokio::spawn(executor.run(request_rx));

    FileSink::new(archive_dir.path()).spawn(result_rx);

    // Provision event admits the pair; first poll fires one interval later.
    let t0 = Utc::now();
    provision_tx
        .send(ProvisionEvent { device_id })
        .await
        .unwrap();

    let archive = wait_for_archive(archive_dir.path(), Duration::from_secs(5))
        .await
        .expect("poll result should reach the archive");
    let elapsed = Utc::now() - t0;
    // Never immediate: the 1s interval must have elapsed first.
    assert!(elapsed >= chrono::Duration::milliseconds(900), "first poll fired too early: {elapsed}");

    let content = std::fs::read_to_string(archive).unwrap();
    assert!(content.contains("\"ip\": \"127.0.0.1\""));
    assert!(content.contains("12.5"));
}

#[tokio::test]
async fn test_failing_plugin_emits_nothing_downstream() {
    let plugin_dir = TempDir::new().unwrap();
    let plugin_path = fake_plugin(&plugin_dir, "echo 'auth failed' >&2; exit 1");

    let (registry, device_id, profile_id) = seeded_registry(Duration::from_secs(60)).await;

    let (request_tx, request_rx) = mpsc::channel(8);
    let (result_tx, mut result_rx) = mpsc::channel(8);
    let executor = PollExecutor::new(
        Arc::clone(&registry),
        Plugin::new(&plugin_path),
        result_tx,
        4,
    );
    let handle = tokio::spawn(executor.run(request_rx));

    let request = PollRequest {
        device_id,
        metric_id: registry.metrics_for_device(device_id)[0].id,
        ip: "127.0.0.1".to_string(),
        port: 22,
        device_type: DeviceType::Linux,
        group: "Linux.CPU".to_string(),
        profile_id,
        timestamp: Utc::now(),
    };

    // Two failures back to back: no downstream message, pool stays alive.
    request_tx.send(request.clone()).await.unwrap();
    request_tx.send(request).await.unwrap();
    drop(request_tx);
    handle.await.unwrap();

    assert!(result_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_timed_out_plugin_keeps_task_schedulable() {
    let plugin_dir = TempDir::new().unwrap();
    let plugin_path = fake_plugin(&plugin_dir, "sleep 30; echo '{}'");

    let (registry, device_id, profile_id) = seeded_registry(Duration::from_secs(60)).await;
    let metric_id = registry.metrics_for_device(device_id)[0].id;

    let (request_tx, request_rx) = mpsc::channel(8);
    let (result_tx, mut result_rx) = mpsc::channel(8);
    let plugin = Plugin::new(&plugin_path).with_poll_timeout(Duration::from_millis(200));
    let executor = PollExecutor::new(Arc::clone(&registry), plugin, result_tx, 4);
    let handle = tokio::spawn(executor.run(request_rx));

    let request = PollRequest {
        device_id,
        metric_id,
        ip: "127.0.0.1".to_string(),
        port: 22,
        device_type: DeviceType::Linux,
        group: "Linux.CPU".to_string(),
        profile_id,
        timestamp: Utc::now(),
    };
    request_tx.send(request).await.unwrap();
    drop(request_tx);
    handle.await.unwrap();

    // Timeout: nothing downstream, and the metric is still there for the
    // scheduler to retry at its next due time.
    assert!(result_rx.try_recv().is_err());
    assert!(registry.metric(metric_id).is_ok());
}

// =============================================================================
// Management API round trip
// =============================================================================

#[tokio::test]
async fn test_management_roundtrip_to_scheduler_event() {
    use argus::prober::{Prober, ProberConfig};
    use argus::server::{AppState, create_router};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let registry = Arc::new(Registry::load(Arc::new(MemStore::new())).await.unwrap());
    let prober = Arc::new(Prober::new(
        Arc::clone(&registry),
        Plugin::new("/bin/true"),
        ProberConfig::default(),
    ));
    let (provision_tx, mut provision_rx) = mpsc::channel(8);
    let app = create_router(AppState {
        registry: Arc::clone(&registry),
        prober,
        provision_tx,
    });

    let post = |uri: &str, body: &str| {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    // Credential, then discovery referencing it.
    let response = app
        .clone()
        .oneshot(post(
            "/api/credentials",
            r#"{"name":"lab","protocol":"SSH","username":"admin","password":"secret"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(post(
            "/api/discoveries",
            r#"{"name":"edge","ip":"10.0.0.5","port":22,"device_type":"SNMP","credential_profiles":[1]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Mark the candidate verified the way the prober would, then provision.
    let mut candidate = registry.discovery(2).unwrap();
    candidate.status = argus::DeviceStatus::Up;
    candidate.resolved_profile = Some(1);
    candidate.hostname = Some("edge-1".to_string());
    registry.update_discovery(candidate).await.unwrap();

    let response = app
        .clone()
        .oneshot(post("/api/provision/2", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // The provisioned event reached the scheduler side, and the SNMP device
    // got its two metric groups.
    let event = provision_rx.try_recv().unwrap();
    let metrics = registry.metrics_for_device(event.device_id);
    assert_eq!(metrics.len(), 2);

    // Re-provisioning the same address conflicts.
    let response = app
        .oneshot(post("/api/provision/2", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
