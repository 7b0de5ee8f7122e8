//! Target driver capability set

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::cloud::CloudDriver;
use crate::deploy::config::{DeploymentConfig, TargetKind};
use crate::deploy::docker::ContainerDriver;
use crate::deploy::local::LocalDriver;
use crate::deploy::static_site::StaticDriver;
use crate::errors::ManagerError;
use crate::logstream::LogAggregator;
use crate::storage::layout::StorageLayout;

/// Result of a driver build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub kind: TargetKind,

    /// Image tag, package path, staged directory, or project directory
    pub reference: String,

    /// Content digest where the artifact is a file (cloud packages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Captured output of the build tool
    pub output: String,

    pub built_at: DateTime<Utc>,
}

/// Handle to a started deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningHandle {
    pub deployment_id: String,
    pub kind: TargetKind,

    /// Supervised process id, for process-backed targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Container name, for container targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub port: Option<u16>,

    /// Health check endpoint probed by `status`, when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
}

/// Point-in-time probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Up and serving (health check passing, when configured)
    Running,

    /// Alive but not serving traffic (health check failing)
    Idle,

    /// Cleanly gone
    Stopped,

    /// Gone without a clean stop
    Crashed,
}

impl ProbeStatus {
    /// Whether the probed deployment counts as up
    pub fn is_up(&self) -> bool {
        matches!(self, ProbeStatus::Running | ProbeStatus::Idle)
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeStatus::Running => "running",
            ProbeStatus::Idle => "idle",
            ProbeStatus::Stopped => "stopped",
            ProbeStatus::Crashed => "crashed",
        };
        write!(f, "{}", s)
    }
}

/// The capability set every deployment substrate implements.
///
/// The orchestrator is target-agnostic: adding a substrate means adding one
/// driver and one entry in `driver_map`, never touching the state machine.
/// Captured output flows push-based into the `LogAggregator`; consumers
/// read and tail through it.
#[async_trait]
pub trait TargetDriver: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Compile or package the project. Failures surface the tool's exit
    /// code and captured output via `ManagerError::BuildError`.
    async fn build(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> Result<BuildArtifact, ManagerError>;

    /// Launch the artifact, binding the configured port. Idempotent: a
    /// double-start for the same deployment id returns the existing handle.
    async fn start(
        &self,
        deployment_id: &str,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<RunningHandle, ManagerError>;

    /// Graceful stop, forced once the grace period elapses
    async fn stop(&self, handle: &RunningHandle, grace: Duration) -> Result<(), ManagerError>;

    /// Point-in-time probe, bounded by `timeout`
    async fn status(
        &self,
        handle: &RunningHandle,
        timeout: Duration,
    ) -> Result<ProbeStatus, ManagerError>;

    /// Stop then start, preserving the deployment id and port
    async fn restart(
        &self,
        handle: &RunningHandle,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
        grace: Duration,
    ) -> Result<RunningHandle, ManagerError> {
        self.stop(handle, grace).await?;
        self.start(&handle.deployment_id, artifact, config).await
    }
}

/// Build the target kind -> driver mapping
pub fn driver_map(
    aggregator: Arc<LogAggregator>,
    layout: &StorageLayout,
) -> Result<HashMap<TargetKind, Arc<dyn TargetDriver>>, ManagerError> {
    let mut drivers: HashMap<TargetKind, Arc<dyn TargetDriver>> = HashMap::new();
    drivers.insert(
        TargetKind::Local,
        Arc::new(LocalDriver::new(aggregator.clone())?),
    );
    drivers.insert(
        TargetKind::Container,
        Arc::new(ContainerDriver::new(aggregator.clone())?),
    );
    drivers.insert(
        TargetKind::Cloud,
        Arc::new(CloudDriver::new(aggregator.clone(), layout.packages_dir())),
    );
    drivers.insert(
        TargetKind::Static,
        Arc::new(StaticDriver::new(aggregator, layout.staging_dir())?),
    );
    Ok(drivers)
}
