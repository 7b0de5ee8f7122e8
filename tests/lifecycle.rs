//! End-to-end lifecycle tests against a scriptable driver

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use deployd::deploy::fsm::DeploymentState;
use deployd::deploy::orchestrator::StopOutcome;
use deployd::errors::ManagerError;
use deployd::registry::ListFilter;
use deployd::telemetry::MetricsSampler;
use deployd::workers::monitor;

use common::{fast_settings, harness, harness_with_settings, request, request_without_port, wait_for_state};

#[tokio::test]
async fn test_deploy_reaches_running() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    assert_eq!(receipt.state, DeploymentState::Pending);
    assert!(receipt.id.starts_with("web-production-"));

    let settled = h.orchestrator.launch(&receipt.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Running);

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Running);
    assert_eq!(instance.url.as_deref(), Some("http://localhost:3000"));
    assert!(instance.started_at.is_some());
    assert!(instance.artifact.is_some());

    // pending, building, starting, running
    assert_eq!(h.orchestrator.history().len(&receipt.id), 4);
    let states: Vec<DeploymentState> = h
        .orchestrator
        .history()
        .for_instance(&receipt.id)
        .iter()
        .map(|s| s.state)
        .collect();
    assert_eq!(
        states,
        vec![
            DeploymentState::Pending,
            DeploymentState::Building,
            DeploymentState::Starting,
            DeploymentState::Running,
        ]
    );
}

#[tokio::test]
async fn test_duplicate_active_deployment_rejected() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    let err = h.orchestrator.submit(request("web", 3000)).await.unwrap_err();
    assert!(matches!(err, ManagerError::ConflictError(_)));

    let running = h
        .orchestrator
        .registry()
        .list(&ListFilter {
            state: Some(DeploymentState::Running),
            ..Default::default()
        })
        .await;
    assert_eq!(running.len(), 1);
}

#[tokio::test]
async fn test_same_port_rejected_while_held() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    // Different project, same target kind and port
    let err = h.orchestrator.submit(request("api", 3000)).await.unwrap_err();
    assert!(matches!(err, ManagerError::ConflictError(_)));

    // A different port is fine
    let receipt2 = h.orchestrator.submit(request("api", 3001)).await.unwrap();
    assert!(receipt2.id.starts_with("api-production-"));
}

#[tokio::test]
async fn test_build_failure_settles_in_failed() {
    let h = harness();
    h.driver.script(|b| b.build_error = Some("tsc exited with errors".to_string()));

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    let settled = h.orchestrator.launch(&receipt.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Failed);

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Failed);
    assert!(instance
        .last_error
        .as_deref()
        .unwrap()
        .contains("tsc exited with errors"));
    assert_eq!(h.driver.start_calls.load(Ordering::SeqCst), 0);

    // Captured build output lands in the failure snapshot
    let snapshots = h.orchestrator.history().for_instance(&receipt.id);
    let last = snapshots.last().unwrap();
    assert_eq!(last.state, DeploymentState::Failed);
    assert!(last.build_output.as_deref().unwrap().contains("tsc"));
}

#[tokio::test]
async fn test_start_failure_retains_artifact() {
    let h = harness();
    h.driver.script(|b| b.start_error = Some("port bind refused".to_string()));

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    let settled = h.orchestrator.launch(&receipt.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Failed);

    // The artifact from the successful build phase stays for inspection
    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert!(instance.artifact.is_some());
    assert!(instance.url.is_none());
}

#[tokio::test]
async fn test_unhealthy_first_probe_settles_in_crashed() {
    let h = harness();
    h.driver.script(|b| b.status = Some(deployd::deploy::driver::ProbeStatus::Crashed));

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    let settled = h.orchestrator.launch(&receipt.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Crashed);
}

#[tokio::test]
async fn test_stop_running_deployment() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    let outcome = h.orchestrator.stop(&receipt.id).await.unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Stopped);
    assert!(instance.stopped_at.is_some());

    // The port is free again
    let receipt2 = h.orchestrator.submit(request("api", 3000)).await.unwrap();
    assert!(receipt2.id.starts_with("api-"));
}

#[tokio::test]
async fn test_stop_on_stopped_is_informational() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();
    h.orchestrator.stop(&receipt.id).await.unwrap();

    let before = h.orchestrator.history().len(&receipt.id);
    let outcome = h.orchestrator.stop(&receipt.id).await.unwrap();
    assert!(matches!(outcome, StopOutcome::AlreadyStopped(_)));
    // No spurious transition was recorded
    assert_eq!(h.orchestrator.history().len(&receipt.id), before);
}

#[tokio::test]
async fn test_stop_during_build_is_deferred() {
    let h = harness();
    h.driver.script(|b| b.build_delay = Some(Duration::from_millis(300)));

    let receipt = h.orchestrator.deploy(request("web", 3000)).await.unwrap();

    // Wait for the build phase, then request a stop mid-build
    let state = wait_for_state(
        &h.orchestrator,
        &receipt.id,
        DeploymentState::Building,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(state, DeploymentState::Building);

    let outcome = h.orchestrator.stop(&receipt.id).await.unwrap();
    assert_eq!(outcome, StopOutcome::Deferred);

    let settled = wait_for_state(
        &h.orchestrator,
        &receipt.id,
        DeploymentState::Stopped,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(settled, DeploymentState::Stopped);

    // The deferred stop won the race: no start was attempted
    assert_eq!(h.driver.start_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_during_first_probe_window_is_honored() {
    let h = harness();
    // Not-up probes keep the instance in starting for the whole window
    h.driver.script(|b| b.status = Some(deployd::deploy::driver::ProbeStatus::Stopped));

    let receipt = h.orchestrator.deploy(request("web", 3000)).await.unwrap();
    let state = wait_for_state(
        &h.orchestrator,
        &receipt.id,
        DeploymentState::Starting,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(state, DeploymentState::Starting);

    let outcome = h.orchestrator.stop(&receipt.id).await.unwrap();
    assert_eq!(outcome, StopOutcome::Deferred);

    let settled = wait_for_state(
        &h.orchestrator,
        &receipt.id,
        DeploymentState::Stopped,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(settled, DeploymentState::Stopped);

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert!(!instance.stop_requested);
    assert_eq!(h.driver.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_superseded_pending_instance_never_launches() {
    let h = harness();

    // Two port-less submissions for the same project and environment; the
    // second supersedes the first while it is still pending
    let first = h.orchestrator.submit(request_without_port("web")).await.unwrap();
    let second = h.orchestrator.submit(request_without_port("web")).await.unwrap();

    let settled = h.orchestrator.launch(&first.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Failed);
    assert_eq!(h.driver.build_calls.load(Ordering::SeqCst), 0);

    let settled = h.orchestrator.launch(&second.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Running);

    // Exactly one visible instance; nothing runs hidden behind the archive
    let visible = h.orchestrator.registry().list(&ListFilter::default()).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, second.id);

    let all = h
        .orchestrator
        .registry()
        .list(&ListFilter {
            include_archived: true,
            ..Default::default()
        })
        .await;
    let running: Vec<_> = all
        .iter()
        .filter(|i| i.state == DeploymentState::Running)
        .collect();
    assert_eq!(running.len(), 1);
}

#[tokio::test]
async fn test_launch_aborts_when_slot_went_active() {
    let h = harness();

    let first = h.orchestrator.submit(request_without_port("web")).await.unwrap();
    let second = h.orchestrator.submit(request_without_port("web")).await.unwrap();

    // The newest submission launches first and takes the slot
    h.orchestrator.launch(&second.id).await.unwrap();

    // Interleaving where the older instance was not superseded before the
    // newer one went active
    h.orchestrator
        .registry()
        .update(&first.id, |inst| inst.archived = false)
        .await
        .unwrap();

    let settled = h.orchestrator.launch(&first.id).await.unwrap();
    assert_eq!(settled, DeploymentState::Failed);
    // The slot holder kept running; the loser never built
    assert_eq!(h.driver.start_calls.load(Ordering::SeqCst), 1);

    let instance = h.orchestrator.registry().get(&first.id).await.unwrap();
    assert!(instance.last_error.is_some());
}

#[tokio::test]
async fn test_monitor_marks_crashed_and_freezes_metrics() {
    let h = harness();
    let sampler = std::sync::Arc::new(MetricsSampler::new());

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    // Pretend an earlier sweep sampled this instance
    let sampled = deployd::telemetry::ResourceSample {
        cpu_pct: 12.5,
        ram_bytes: 64 * 1024 * 1024,
        sampled_at: chrono::Utc::now(),
    };
    h.orchestrator
        .registry()
        .update(&receipt.id, |inst| inst.last_metrics = Some(sampled))
        .await
        .unwrap();

    // A healthy sweep leaves the instance alone
    monitor::poll_once(&h.orchestrator, &sampler).await;
    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Running);

    h.driver.script(|b| b.probe_times_out = true);
    monitor::poll_once(&h.orchestrator, &sampler).await;

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Crashed);
    assert!(instance.last_error.is_some());
    // Metrics stay frozen at the last sample taken while alive
    assert_eq!(instance.last_metrics, Some(sampled));

    // No automatic restart happens
    tokio::time::sleep(Duration::from_millis(100)).await;
    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Crashed);
    assert_eq!(h.driver.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_monitor_covers_starting_instances() {
    // A wide probe window keeps the instance in starting during the sweep
    let mut settings = fast_settings();
    settings.first_probe_timeout = Duration::from_secs(5);
    let h = harness_with_settings(settings);
    let sampler = std::sync::Arc::new(MetricsSampler::new());
    h.driver.script(|b| b.status = Some(deployd::deploy::driver::ProbeStatus::Stopped));

    let receipt = h.orchestrator.deploy(request("web", 3000)).await.unwrap();

    // Wait until start returned and the handle is recorded
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let handled = h
            .orchestrator
            .registry()
            .get(&receipt.id)
            .await
            .map(|i| i.handle.is_some())
            .unwrap_or(false);
        if handled {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "handle never recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Starting);

    monitor::poll_once(&h.orchestrator, &sampler).await;

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Crashed);
    assert!(instance
        .last_error
        .as_deref()
        .unwrap()
        .contains("Health probe reported"));
}

#[tokio::test]
async fn test_restart_preserves_id_and_port() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();
    h.orchestrator.stop(&receipt.id).await.unwrap();

    h.driver.script(|b| b.status = None);
    let settled = h.orchestrator.restart(&receipt.id, false).await.unwrap();
    assert_eq!(settled, DeploymentState::Running);

    let instance = h.orchestrator.registry().get(&receipt.id).await.unwrap();
    assert_eq!(instance.id, receipt.id);
    assert_eq!(instance.config.port, Some(3000));
    // Reused the existing artifact
    assert_eq!(h.driver.build_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.driver.start_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_with_rebuild_builds_again() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();
    h.orchestrator.stop(&receipt.id).await.unwrap();

    h.driver.script(|b| b.status = None);
    let settled = h.orchestrator.restart(&receipt.id, true).await.unwrap();
    assert_eq!(settled, DeploymentState::Running);
    assert_eq!(h.driver.build_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_requires_stopped_instance() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    // Restart on a running instance stops it first, so force a pending one
    let pending = h.orchestrator.submit(request("api", 3001)).await.unwrap();
    let err = h.orchestrator.restart(&pending.id, false).await.unwrap_err();
    assert!(matches!(err, ManagerError::TransitionError(_)));
}

#[tokio::test]
async fn test_new_deployment_archives_superseded() {
    let h = harness();

    let first = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&first.id).await.unwrap();
    h.orchestrator.stop(&first.id).await.unwrap();

    h.driver.script(|b| b.status = None);
    let second = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&second.id).await.unwrap();

    let visible = h.orchestrator.registry().list(&ListFilter::default()).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, second.id);

    let all = h
        .orchestrator
        .registry()
        .list(&ListFilter {
            include_archived: true,
            ..Default::default()
        })
        .await;
    assert_eq!(all.len(), 2);

    // History survives archival
    assert!(h.orchestrator.history().len(&first.id) >= 4);
}

#[tokio::test]
async fn test_archive_rejects_active_instance() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    let err = h.orchestrator.archive(&receipt.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::TransitionError(_)));

    h.orchestrator.stop(&receipt.id).await.unwrap();
    h.orchestrator.archive(&receipt.id).await.unwrap();

    let visible = h.orchestrator.registry().list(&ListFilter::default()).await;
    assert!(visible.is_empty());
}

#[tokio::test]
async fn test_crashed_instance_keeps_port_until_stopped() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    h.orchestrator
        .mark_crashed(&receipt.id, "probe lost".to_string())
        .await
        .unwrap();

    // Port still held by the crashed instance, for debugging
    let err = h.orchestrator.submit(request("api", 3000)).await.unwrap_err();
    assert!(matches!(err, ManagerError::ConflictError(_)));

    let outcome = h.orchestrator.stop(&receipt.id).await.unwrap();
    assert!(matches!(outcome, StopOutcome::AlreadyStopped(_)));

    // Released now
    h.orchestrator.submit(request("api", 3000)).await.unwrap();
}

#[tokio::test]
async fn test_deployment_logs_reset_between_attempts() {
    let h = harness();

    let receipt = h.orchestrator.submit(request("web", 3000)).await.unwrap();
    h.orchestrator.launch(&receipt.id).await.unwrap();

    let first_lines = h.orchestrator.aggregator().read_since(&receipt.id, None);
    assert!(!first_lines.is_empty());
    let last_seq = first_lines.last().unwrap().seq;

    h.orchestrator.stop(&receipt.id).await.unwrap();
    h.driver.script(|b| b.status = None);
    h.orchestrator.restart(&receipt.id, true).await.unwrap();

    // The buffer restarted but sequence numbers keep growing, so an old
    // reader offset never yields stale lines
    let lines = h.orchestrator.aggregator().read_since(&receipt.id, None);
    assert!(lines.iter().all(|l| l.seq > last_seq));
}
