//! Shared test fixtures: a scriptable driver and an orchestrator harness

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use deployd::deploy::config::{DeploymentConfig, RawDeployRequest, TargetKind};
use deployd::deploy::driver::{BuildArtifact, ProbeStatus, RunningHandle, TargetDriver};
use deployd::deploy::fsm::DeploymentState;
use deployd::deploy::orchestrator::{Orchestrator, OrchestratorSettings};
use deployd::errors::ManagerError;
use deployd::logstream::LogAggregator;
use deployd::registry::history::HistoryLog;
use deployd::registry::DeploymentRegistry;

/// Scripted behavior for the next driver calls
#[derive(Default)]
pub struct FakeBehavior {
    pub build_error: Option<String>,
    pub build_delay: Option<Duration>,
    pub start_error: Option<String>,
    pub start_delay: Option<Duration>,
    pub stop_error: Option<String>,
    pub status: Option<ProbeStatus>,
    pub probe_times_out: bool,
}

/// In-memory driver with scriptable outcomes, standing in for a real
/// substrate in lifecycle tests.
pub struct FakeDriver {
    kind: TargetKind,
    behavior: Mutex<FakeBehavior>,
    pub build_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl FakeDriver {
    pub fn new(kind: TargetKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behavior: Mutex::new(FakeBehavior::default()),
            build_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, f: impl FnOnce(&mut FakeBehavior)) {
        let mut behavior = self.behavior.lock().unwrap();
        f(&mut behavior);
    }

    fn snapshot(&self) -> FakeBehavior {
        let behavior = self.behavior.lock().unwrap();
        FakeBehavior {
            build_error: behavior.build_error.clone(),
            build_delay: behavior.build_delay,
            start_error: behavior.start_error.clone(),
            start_delay: behavior.start_delay,
            stop_error: behavior.stop_error.clone(),
            status: behavior.status,
            probe_times_out: behavior.probe_times_out,
        }
    }
}

#[async_trait]
impl TargetDriver for FakeDriver {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    async fn build(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> Result<BuildArtifact, ManagerError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.snapshot();
        if let Some(delay) = behavior.build_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = behavior.build_error {
            return Err(ManagerError::build_failed(
                message.clone(),
                Some(1),
                format!("{}\n", message),
            ));
        }
        Ok(BuildArtifact {
            kind: self.kind,
            reference: format!("fake/{}:{}", config.project_name, deployment_id),
            digest: None,
            output: "build ok".to_string(),
            built_at: Utc::now(),
        })
    }

    async fn start(
        &self,
        deployment_id: &str,
        _artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<RunningHandle, ManagerError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.snapshot();
        if let Some(delay) = behavior.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = behavior.start_error {
            return Err(ManagerError::StartError(message));
        }
        Ok(RunningHandle {
            deployment_id: deployment_id.to_string(),
            kind: self.kind,
            pid: None,
            container_name: None,
            url: Some(format!("http://localhost:{}", config.port.unwrap_or(80))),
            port: config.port,
            health_check_url: None,
        })
    }

    async fn stop(&self, _handle: &RunningHandle, _grace: Duration) -> Result<(), ManagerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.snapshot();
        if let Some(message) = behavior.stop_error {
            return Err(ManagerError::StopError(message));
        }
        self.script(|b| b.status = Some(ProbeStatus::Stopped));
        Ok(())
    }

    async fn status(
        &self,
        _handle: &RunningHandle,
        timeout: Duration,
    ) -> Result<ProbeStatus, ManagerError> {
        let behavior = self.snapshot();
        if behavior.probe_times_out {
            return Err(ManagerError::ProbeTimeout(timeout));
        }
        Ok(behavior.status.unwrap_or(ProbeStatus::Running))
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub driver: Arc<FakeDriver>,
    pub workspace: TempDir,
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        driver_timeout: Duration::from_secs(5),
        grace_period: Duration::from_millis(100),
        first_probe_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_millis(200),
        probe_retry_delay: Duration::from_millis(20),
    }
}

pub fn harness() -> Harness {
    harness_with_settings(fast_settings())
}

pub fn harness_with_settings(settings: OrchestratorSettings) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let registry = Arc::new(DeploymentRegistry::new());
    let aggregator = Arc::new(LogAggregator::new(200));
    let history = Arc::new(HistoryLog::in_memory());
    let driver = FakeDriver::new(TargetKind::Local);

    let mut drivers: HashMap<TargetKind, Arc<dyn TargetDriver>> = HashMap::new();
    drivers.insert(TargetKind::Local, driver.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        drivers,
        aggregator,
        history,
        settings,
        workspace.path().to_path_buf(),
    ));

    Harness {
        orchestrator,
        driver,
        workspace,
    }
}

/// A valid local-target request
pub fn request(project: &str, port: u16) -> RawDeployRequest {
    RawDeployRequest {
        project_name: project.to_string(),
        target: "local".to_string(),
        environment: "production".to_string(),
        port: Some(port),
        env: vec![],
        build_command: None,
        start_command: Some("sleep 60".to_string()),
        build_context: None,
        credentials_ref: None,
        health_check_url: None,
    }
}

/// A valid local-target request with no port reservation
pub fn request_without_port(project: &str) -> RawDeployRequest {
    RawDeployRequest {
        port: None,
        ..request(project, 0)
    }
}

/// Poll until the instance reaches `expected` or the deadline passes
pub async fn wait_for_state(
    orchestrator: &Arc<Orchestrator>,
    id: &str,
    expected: DeploymentState,
    deadline: Duration,
) -> DeploymentState {
    let start = std::time::Instant::now();
    loop {
        let state = orchestrator
            .registry()
            .get(id)
            .await
            .map(|inst| inst.state)
            .expect("instance exists");
        if state == expected || start.elapsed() > deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
