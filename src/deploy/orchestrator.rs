//! Lifecycle orchestrator: drives deployments through the state machine

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::config::{validate, RawDeployRequest, TargetKind};
use crate::deploy::driver::{BuildArtifact, ProbeStatus, RunningHandle, TargetDriver};
use crate::deploy::fsm::{DeploymentState, LifecycleEvent, LifecycleFsm, Transition};
use crate::errors::ManagerError;
use crate::logstream::{LogAggregator, LogStreamKind};
use crate::registry::history::{HistoryLog, Snapshot};
use crate::registry::{DeploymentInstance, DeploymentRegistry};

/// Timeouts and policy knobs for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Caller-supplied timeout for every driver call; elapsing is a failure
    pub driver_timeout: Duration,

    /// Grace period before a stop is forced
    pub grace_period: Duration,

    /// Window for the first healthy probe after start; "process launched"
    /// is not "service healthy"
    pub first_probe_timeout: Duration,

    /// Bound for a single status probe
    pub probe_timeout: Duration,

    /// Delay between first-probe attempts
    pub probe_retry_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            driver_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(10),
            first_probe_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            probe_retry_delay: Duration::from_millis(250),
        }
    }
}

/// Returned to the caller on acceptance of a deployment request
#[derive(Debug, Clone, Serialize)]
pub struct DeployReceipt {
    pub id: String,
    pub state: DeploymentState,
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The instance was running and is now stopped
    Stopped,

    /// Nothing to stop; informational, not an error
    AlreadyStopped(String),

    /// A driver call is in flight; the stop is honored as soon as it returns
    Deferred,
}

/// Drives deployments through their lifecycle, target-agnostically.
///
/// Single-writer per instance: transitions go through the registry's per-id
/// lock, which is held only across the state mutation itself, never across
/// a driver call.
pub struct Orchestrator {
    registry: Arc<DeploymentRegistry>,
    drivers: HashMap<TargetKind, Arc<dyn TargetDriver>>,
    aggregator: Arc<LogAggregator>,
    history: Arc<HistoryLog>,
    settings: OrchestratorSettings,
    workspace: PathBuf,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<DeploymentRegistry>,
        drivers: HashMap<TargetKind, Arc<dyn TargetDriver>>,
        aggregator: Arc<LogAggregator>,
        history: Arc<HistoryLog>,
        settings: OrchestratorSettings,
        workspace: PathBuf,
    ) -> Self {
        Self {
            registry,
            drivers,
            aggregator,
            history,
            settings,
            workspace,
        }
    }

    pub fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.history
    }

    pub fn aggregator(&self) -> &Arc<LogAggregator> {
        &self.aggregator
    }

    fn driver(&self, kind: TargetKind) -> Result<Arc<dyn TargetDriver>, ManagerError> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ManagerError::ConfigError(format!("No driver for target kind: {}", kind)))
    }

    fn snapshot_of(
        instance: &DeploymentInstance,
        cause: Option<String>,
        build_output: Option<String>,
    ) -> Snapshot {
        Snapshot {
            id: instance.id.clone(),
            project: instance.config.project_name.clone(),
            environment: instance.config.environment.to_string(),
            seq: instance.transition_seq,
            state: instance.state,
            cause,
            url: instance.url.clone(),
            build_output,
            metrics: instance.last_metrics,
            recorded_at: Utc::now(),
        }
    }

    /// Apply a lifecycle event under the instance's lock and record the
    /// resulting snapshot. Transitions are never silently skipped.
    async fn apply(
        &self,
        id: &str,
        event: LifecycleEvent,
        cause: Option<String>,
        build_output: Option<String>,
    ) -> Result<Transition, ManagerError> {
        let (result, snapshot) = self
            .registry
            .update(id, |instance| {
                let mut fsm = LifecycleFsm::from_state(instance.state);
                let result = fsm.process(event);
                let snapshot = match &result {
                    Ok(Transition::Changed { to, .. }) => {
                        instance.state = *to;
                        instance.transition_seq += 1;
                        if let Some(err) = fsm.error() {
                            instance.last_error = Some(err.to_string());
                        }
                        Some(Self::snapshot_of(instance, cause, build_output))
                    }
                    _ => None,
                };
                (result, snapshot)
            })
            .await?;

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.history.append(snapshot).await {
                error!("Failed to persist history snapshot for {}: {}", id, e);
            }
        }

        match result {
            Ok(transition) => {
                if let Transition::Changed { from, to } = &transition {
                    info!("Deployment {}: {} -> {}", id, from, to);
                }
                Ok(transition)
            }
            Err(e) => Err(ManagerError::TransitionError(e)),
        }
    }

    fn release_port_of(&self, instance: &DeploymentInstance) {
        if let Some(port) = instance.config.port {
            self.registry
                .release_port(instance.config.target, port, &instance.id);
        }
    }

    fn generate_id(&self, project: &str, environment: &str) -> String {
        format!(
            "{}-{}-{}",
            project,
            environment,
            Utc::now().format("%Y%m%d%H%M%S")
        )
    }

    /// Validate and register a deployment request. Returns the id and the
    /// initial state; `launch` performs the build/start work.
    pub async fn submit(&self, raw: RawDeployRequest) -> Result<DeployReceipt, ManagerError> {
        let ports = self.registry.port_snapshot();
        let config = validate(raw, &self.workspace, &ports)?;

        if let Some(existing) = self
            .registry
            .active_conflict(&config.project_name, &config.environment, config.port)
            .await
        {
            return Err(ManagerError::ConflictError(format!(
                "Deployment {} is already active for {}/{}",
                existing, config.project_name, config.environment
            )));
        }

        let base = self.generate_id(&config.project_name, config.environment.as_str());
        let mut id = base.clone();
        let mut n = 1;
        while self.registry.contains(&id).await {
            n += 1;
            id = format!("{}-{}", base, n);
        }

        // Transactional reservation; the validator only saw a snapshot
        if let Some(port) = config.port {
            if !self.registry.reserve_port(config.target, port, &id) {
                return Err(ManagerError::ConflictError(format!(
                    "Port {} was taken by a concurrent deployment",
                    port
                )));
            }
        }

        let instance = DeploymentInstance::new(id.clone(), config);
        let snapshot = Self::snapshot_of(&instance, None, None);
        let project = instance.config.project_name.clone();
        let environment = instance.config.environment.clone();
        let target = instance.config.target;
        let port = instance.config.port;

        if let Err(e) = self.registry.register(instance).await {
            if let Some(port) = port {
                self.registry.release_port(target, port, &id);
            }
            return Err(e);
        }

        // History is append-only: superseded instances are archived, never
        // deleted
        for archived in self
            .registry
            .archive_superseded(&project, &environment, &id)
            .await
        {
            info!("Archived superseded deployment {}", archived);
            self.aggregator.remove(&archived);
        }

        if let Err(e) = self.history.append(snapshot).await {
            error!("Failed to persist initial snapshot for {}: {}", id, e);
        }

        info!("Accepted deployment {} ({} / {})", id, project, environment);
        Ok(DeployReceipt {
            id,
            state: DeploymentState::Pending,
        })
    }

    /// Submit and drive the lifecycle in a background task
    pub async fn deploy(self: &Arc<Self>, raw: RawDeployRequest) -> Result<DeployReceipt, ManagerError> {
        let receipt = self.submit(raw).await?;
        self.spawn_launch(receipt.id.clone());
        Ok(receipt)
    }

    pub fn spawn_launch(self: &Arc<Self>, id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.launch(&id).await {
                error!("Deployment {} failed to launch: {}", id, e);
            }
        });
    }

    /// Drive a submitted deployment through build and start. Returns the
    /// state the instance settled in.
    pub async fn launch(&self, id: &str) -> Result<DeploymentState, ManagerError> {
        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?;
        let config = instance.config.clone();
        let driver = self.driver(config.target)?;

        // A newer submission may have superseded this instance between
        // submit and launch; an archived instance never launches
        if instance.archived {
            let cause = "Superseded by a newer deployment before launch".to_string();
            self.apply(id, LifecycleEvent::Fail(cause.clone()), Some(cause), None)
                .await?;
            return Ok(DeploymentState::Failed);
        }

        // The slot check in submit saw a snapshot; another instance may have
        // gone active for the same slot since
        if let Some(existing) = self
            .registry
            .active_conflict(&config.project_name, &config.environment, config.port)
            .await
        {
            if existing != id {
                let cause = format!(
                    "Deployment {} went active for {}/{} first",
                    existing, config.project_name, config.environment
                );
                self.apply(id, LifecycleEvent::Fail(cause.clone()), Some(cause), None)
                    .await?;
                return Ok(DeploymentState::Failed);
            }
        }

        self.apply(id, LifecycleEvent::Accept, None, None).await?;

        // New artifact: the log buffer starts over
        self.aggregator.reset(id);
        self.aggregator.append(
            id,
            LogStreamKind::System,
            format!("Deploying {} to {}", config.project_name, config.target),
        );

        let artifact = match tokio::time::timeout(
            self.settings.driver_timeout,
            driver.build(id, &config),
        )
        .await
        {
            Err(_) => {
                let cause = format!("Build timed out after {:?}", self.settings.driver_timeout);
                self.apply(id, LifecycleEvent::BuildFailed(cause.clone()), Some(cause), None)
                    .await?;
                return Ok(DeploymentState::Failed);
            }
            Ok(Err(e)) => {
                let output = match &e {
                    ManagerError::BuildError { output, .. } => Some(output.clone()),
                    _ => None,
                };
                let cause = e.cause();
                self.apply(id, LifecycleEvent::BuildFailed(cause.clone()), Some(cause), output)
                    .await?;
                return Ok(DeploymentState::Failed);
            }
            Ok(Ok(artifact)) => artifact,
        };

        self.registry
            .update(id, |inst| inst.artifact = Some(artifact.clone()))
            .await?;

        // A stop requested during the build is honored now, before start
        if self.stop_was_requested(id).await? {
            return self.complete_deferred_stop(id, &driver, None).await;
        }

        self.apply(id, LifecycleEvent::BuildOk, None, Some(artifact.output.clone()))
            .await?;

        self.start_phase(id, &driver, &artifact, &config).await
    }

    async fn stop_was_requested(&self, id: &str) -> Result<bool, ManagerError> {
        Ok(self
            .registry
            .get(id)
            .await
            .map(|inst| inst.stop_requested)
            .unwrap_or(false))
    }

    /// Finish a stop that was requested while build/start was in flight
    async fn complete_deferred_stop(
        &self,
        id: &str,
        driver: &Arc<dyn TargetDriver>,
        handle: Option<&RunningHandle>,
    ) -> Result<DeploymentState, ManagerError> {
        info!("Honoring deferred stop for {}", id);
        self.apply(id, LifecycleEvent::StopRequested, None, None).await?;

        if let Some(handle) = handle {
            if let Err(e) = driver.stop(handle, self.settings.grace_period).await {
                warn!("Driver stop failed during deferred stop of {}: {}", id, e);
            }
        }

        let instance = self
            .registry
            .update(id, |inst| {
                inst.stop_requested = false;
                inst.stopped_at = Some(Utc::now());
                inst.clone()
            })
            .await?;
        self.apply(id, LifecycleEvent::StopComplete, Some("Stop requested by caller".to_string()), None)
            .await?;
        self.release_port_of(&instance);
        Ok(DeploymentState::Stopped)
    }

    /// Start the artifact and wait for the first healthy probe. Assumes the
    /// instance is in `starting`.
    async fn start_phase(
        &self,
        id: &str,
        driver: &Arc<dyn TargetDriver>,
        artifact: &BuildArtifact,
        config: &crate::deploy::config::DeploymentConfig,
    ) -> Result<DeploymentState, ManagerError> {
        let handle = match tokio::time::timeout(
            self.settings.driver_timeout,
            driver.start(id, artifact, config),
        )
        .await
        {
            Err(_) => {
                let cause = format!("Start timed out after {:?}", self.settings.driver_timeout);
                self.apply(id, LifecycleEvent::StartFailed(cause.clone()), Some(cause), None)
                    .await?;
                return Ok(DeploymentState::Failed);
            }
            Ok(Err(e)) => {
                let cause = e.cause();
                self.apply(id, LifecycleEvent::StartFailed(cause.clone()), Some(cause), None)
                    .await?;
                return Ok(DeploymentState::Failed);
            }
            Ok(Ok(handle)) => handle,
        };

        self.registry
            .update(id, |inst| {
                inst.handle = Some(handle.clone());
                inst.url = handle.url.clone();
            })
            .await?;

        if self.stop_was_requested(id).await? {
            return self.complete_deferred_stop(id, driver, Some(&handle)).await;
        }

        // The process launched; now wait for the service to look healthy
        let deadline = Instant::now() + self.settings.first_probe_timeout;
        loop {
            match driver.status(&handle, self.settings.probe_timeout).await {
                Ok(status) if status.is_up() => break,
                Ok(status) => {
                    debug!("First probe for {} reported {:?}", id, status);
                }
                Err(e) => {
                    debug!("First probe for {} failed: {}", id, e);
                }
            }
            if Instant::now() >= deadline {
                let cause = format!(
                    "Service did not become healthy within {:?}",
                    self.settings.first_probe_timeout
                );
                self.apply(id, LifecycleEvent::Crash(cause.clone()), Some(cause), None)
                    .await?;
                return Ok(DeploymentState::Crashed);
            }
            tokio::time::sleep(self.settings.probe_retry_delay).await;
            if self.stop_was_requested(id).await? {
                return self.complete_deferred_stop(id, driver, Some(&handle)).await;
            }
        }

        // A stop issued during the probe window wins over the healthy verdict
        if self.stop_was_requested(id).await? {
            return self.complete_deferred_stop(id, driver, Some(&handle)).await;
        }

        self.registry
            .update(id, |inst| inst.started_at = Some(Utc::now()))
            .await?;
        self.apply(id, LifecycleEvent::StartOk, None, None).await?;
        Ok(DeploymentState::Running)
    }

    /// Stop a deployment. Stopping something already stopped is an
    /// informational no-op; a stop during build/start is deferred until the
    /// in-flight driver call returns.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome, ManagerError> {
        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?;

        match instance.state {
            DeploymentState::Building | DeploymentState::Starting => {
                self.registry
                    .update(id, |inst| inst.stop_requested = true)
                    .await?;
                info!("Stop for {} deferred until the in-flight driver call returns", id);
                Ok(StopOutcome::Deferred)
            }
            DeploymentState::Running => {
                let driver = self.driver(instance.config.target)?;
                let handle = instance.handle.clone().ok_or_else(|| {
                    ManagerError::Internal(format!("Running deployment {} has no handle", id))
                })?;

                self.apply(id, LifecycleEvent::StopRequested, None, None).await?;

                if let Err(e) = driver.stop(&handle, self.settings.grace_period).await {
                    let cause = e.cause();
                    self.apply(id, LifecycleEvent::Fail(cause.clone()), Some(cause), None)
                        .await?;
                    return Err(e);
                }

                let instance = self
                    .registry
                    .update(id, |inst| {
                        inst.stopped_at = Some(Utc::now());
                        inst.clone()
                    })
                    .await?;
                self.apply(id, LifecycleEvent::StopComplete, Some("Stop requested by caller".to_string()), None)
                    .await?;
                self.release_port_of(&instance);
                Ok(StopOutcome::Stopped)
            }
            DeploymentState::Stopping => {
                Ok(StopOutcome::AlreadyStopped("Stop already in progress".to_string()))
            }
            DeploymentState::Crashed => {
                // Explicit stop on a crashed instance cleans up and releases
                // the port it was holding
                if let Some(handle) = &instance.handle {
                    let driver = self.driver(instance.config.target)?;
                    if let Err(e) = driver.stop(handle, self.settings.grace_period).await {
                        debug!("Cleanup stop for crashed {} reported: {}", id, e);
                    }
                }
                self.release_port_of(&instance);
                Ok(StopOutcome::AlreadyStopped(
                    "Instance had crashed; resources released".to_string(),
                ))
            }
            state => Ok(StopOutcome::AlreadyStopped(format!(
                "Already {}, nothing to stop",
                state
            ))),
        }
    }

    /// Restart a stopped or crashed deployment, preserving its id and port.
    /// The existing artifact is reused unless `rebuild` is set.
    pub async fn restart(&self, id: &str, rebuild: bool) -> Result<DeploymentState, ManagerError> {
        let mut instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?;

        if instance.state == DeploymentState::Running {
            match self.stop(id).await? {
                StopOutcome::Stopped => {}
                other => {
                    return Err(ManagerError::TransitionError(format!(
                        "Could not stop {} before restart: {:?}",
                        id, other
                    )));
                }
            }
            instance = self
                .registry
                .get(id)
                .await
                .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?;
        }

        if !matches!(
            instance.state,
            DeploymentState::Stopped | DeploymentState::Crashed
        ) {
            return Err(ManagerError::TransitionError(format!(
                "Restart requires a stopped or crashed instance, {} is {}",
                id, instance.state
            )));
        }

        let config = instance.config.clone();
        let driver = self.driver(config.target)?;

        // The port may have been released by the explicit stop; take it back
        // under the same id before anything else happens
        if let Some(port) = config.port {
            if !self.registry.reserve_port(config.target, port, id) {
                return Err(ManagerError::ConflictError(format!(
                    "Port {} was claimed by another deployment since {} stopped",
                    port, id
                )));
            }
        }

        self.registry
            .update(id, |inst| inst.stop_requested = false)
            .await?;
        self.apply(id, LifecycleEvent::Restart, None, None).await?;

        let artifact = if rebuild {
            // New artifact: buffer resets, same as an initial launch
            self.aggregator.reset(id);
            match tokio::time::timeout(self.settings.driver_timeout, driver.build(id, &config)).await {
                Err(_) => {
                    let cause = format!("Rebuild timed out after {:?}", self.settings.driver_timeout);
                    self.apply(id, LifecycleEvent::StartFailed(cause.clone()), Some(cause), None)
                        .await?;
                    return Ok(DeploymentState::Failed);
                }
                Ok(Err(e)) => {
                    let output = match &e {
                        ManagerError::BuildError { output, .. } => Some(output.clone()),
                        _ => None,
                    };
                    let cause = e.cause();
                    self.apply(id, LifecycleEvent::StartFailed(cause.clone()), Some(cause), output)
                        .await?;
                    return Ok(DeploymentState::Failed);
                }
                Ok(Ok(artifact)) => {
                    self.registry
                        .update(id, |inst| inst.artifact = Some(artifact.clone()))
                        .await?;
                    artifact
                }
            }
        } else {
            match instance.artifact {
                Some(artifact) => artifact,
                None => {
                    let cause = "No artifact to restart; rebuild required".to_string();
                    self.apply(id, LifecycleEvent::StartFailed(cause.clone()), Some(cause), None)
                        .await?;
                    return Ok(DeploymentState::Failed);
                }
            }
        };

        self.start_phase(id, &driver, &artifact, &config).await
    }

    /// Monitor entry point: record a crash detected by an external probe.
    /// Metrics stay frozen at the last successful sample. Races with a
    /// concurrent stop resolve in favor of whoever transitions first.
    pub async fn mark_crashed(&self, id: &str, cause: String) -> Result<(), ManagerError> {
        match self
            .apply(id, LifecycleEvent::Crash(cause.clone()), Some(cause), None)
            .await
        {
            Ok(_) => {
                warn!("Deployment {} marked crashed", id);
                Ok(())
            }
            Err(ManagerError::TransitionError(reason)) => {
                debug!("Crash report for {} ignored: {}", id, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Probe the current status of a deployment through its driver
    pub async fn probe(&self, id: &str) -> Result<ProbeStatus, ManagerError> {
        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?;
        let handle = instance.handle.ok_or_else(|| {
            ManagerError::Internal(format!("Deployment {} has no running handle", id))
        })?;
        let driver = self.driver(instance.config.target)?;
        driver.status(&handle, self.settings.probe_timeout).await
    }

    /// Archive an inactive instance: hidden from the default listing, port
    /// released, log buffer dropped. History keeps every snapshot.
    pub async fn archive(&self, id: &str) -> Result<(), ManagerError> {
        let instance = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?;

        if instance.state.is_active() {
            return Err(ManagerError::TransitionError(format!(
                "Cannot archive {} while {}; stop it first",
                id, instance.state
            )));
        }

        let instance = self
            .registry
            .update(id, |inst| {
                inst.archived = true;
                inst.clone()
            })
            .await?;
        self.release_port_of(&instance);
        self.aggregator.remove(id);

        let snapshot = Self::snapshot_of(&instance, Some("Archived by operator".to_string()), None);
        if let Err(e) = self.history.append(snapshot).await {
            error!("Failed to persist archive snapshot for {}: {}", id, e);
        }
        Ok(())
    }
}
