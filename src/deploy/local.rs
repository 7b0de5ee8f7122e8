//! Local process deployment driver

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::config::{DeploymentConfig, TargetKind};
use crate::deploy::driver::{BuildArtifact, ProbeStatus, RunningHandle, TargetDriver};
use crate::deploy::process::{run_build_command, ProcessSupervisor};
use crate::errors::ManagerError;
use crate::logstream::{LogAggregator, LogStreamKind};

/// Runs a project as a supervised process on the local host
pub struct LocalDriver {
    supervisor: ProcessSupervisor,
    aggregator: Arc<LogAggregator>,
    http: reqwest::Client,
}

impl LocalDriver {
    pub fn new(aggregator: Arc<LogAggregator>) -> Result<Self, ManagerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            supervisor: ProcessSupervisor::new(aggregator.clone()),
            aggregator,
            http,
        })
    }
}

/// Probe an HTTP health endpoint: 2xx is running, anything else idle
pub(crate) async fn health_probe(http: &reqwest::Client, url: &str) -> ProbeStatus {
    match http.get(url).send().await {
        Ok(response) if response.status().is_success() => ProbeStatus::Running,
        Ok(_) | Err(_) => ProbeStatus::Idle,
    }
}

/// Liveness of an unsupervised pid, via kill -0
pub(crate) async fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[async_trait]
impl TargetDriver for LocalDriver {
    fn kind(&self) -> TargetKind {
        TargetKind::Local
    }

    async fn build(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> Result<BuildArtifact, ManagerError> {
        let output = match &config.build_command {
            Some(command) => {
                info!("Building {} with: {}", config.project_name, command);
                let output = run_build_command(command, &config.project_dir, &config.env_vars).await?;
                self.aggregator.append(
                    deployment_id,
                    LogStreamKind::System,
                    format!("Build completed: {}", command),
                );
                output
            }
            None => {
                debug!("No build command for {}, skipping build", config.project_name);
                String::new()
            }
        };

        Ok(BuildArtifact {
            kind: TargetKind::Local,
            reference: config.project_dir.display().to_string(),
            digest: None,
            output,
            built_at: Utc::now(),
        })
    }

    async fn start(
        &self,
        deployment_id: &str,
        _artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<RunningHandle, ManagerError> {
        let command = config
            .start_command
            .as_deref()
            .ok_or_else(|| ManagerError::StartError("No start command configured".to_string()))?;

        info!("Starting {} as local process: {}", deployment_id, command);
        let pid = self
            .supervisor
            .spawn(deployment_id, command, &config.project_dir, &config.env_vars, config.port)
            .await?;

        Ok(RunningHandle {
            deployment_id: deployment_id.to_string(),
            kind: TargetKind::Local,
            pid: Some(pid),
            container_name: None,
            url: config.port.map(|p| format!("http://localhost:{}", p)),
            port: config.port,
            health_check_url: config.health_check_url.as_ref().map(|u| u.to_string()),
        })
    }

    async fn stop(&self, handle: &RunningHandle, grace: Duration) -> Result<(), ManagerError> {
        self.supervisor.stop(&handle.deployment_id, grace).await
    }

    async fn status(
        &self,
        handle: &RunningHandle,
        timeout: Duration,
    ) -> Result<ProbeStatus, ManagerError> {
        let probe = async {
            let alive = match self.supervisor.pid_if_alive(&handle.deployment_id).await {
                Some(_) => true,
                None if self.supervisor.exited(&handle.deployment_id).await => {
                    return ProbeStatus::Crashed;
                }
                // Not supervised here (e.g. manager restart); fall back to pid
                None => match handle.pid {
                    Some(pid) => pid_alive(pid).await,
                    None => false,
                },
            };

            if !alive {
                return ProbeStatus::Stopped;
            }
            match &handle.health_check_url {
                Some(url) => health_probe(&self.http, url).await,
                None => ProbeStatus::Running,
            }
        };

        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| ManagerError::ProbeTimeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;

    fn config(workspace: &Path, start: &str, build: Option<&str>) -> DeploymentConfig {
        std::fs::create_dir_all(workspace.join("demo")).unwrap();
        let raw = crate::deploy::config::RawDeployRequest {
            project_name: "demo".to_string(),
            target: "local".to_string(),
            environment: "development".to_string(),
            port: None,
            env: vec![],
            build_command: build.map(|s| s.to_string()),
            start_command: Some(start.to_string()),
            build_context: None,
            credentials_ref: None,
            health_check_url: None,
        };
        crate::deploy::config::validate(raw, workspace, &HashSet::new()).unwrap()
    }

    #[tokio::test]
    async fn test_full_process_lifecycle() {
        let workspace = tempfile::tempdir().unwrap();
        let aggregator = Arc::new(LogAggregator::new(100));
        let driver = LocalDriver::new(aggregator.clone()).unwrap();
        let config = config(workspace.path(), "echo up; sleep 30", None);

        let artifact = driver.build("demo-development-1", &config).await.unwrap();
        let handle = driver.start("demo-development-1", &artifact, &config).await.unwrap();
        assert!(handle.pid.is_some());

        let status = driver.status(&handle, Duration::from_secs(2)).await.unwrap();
        assert_eq!(status, ProbeStatus::Running);

        driver.stop(&handle, Duration::from_secs(2)).await.unwrap();
        let status = driver.status(&handle, Duration::from_secs(2)).await.unwrap();
        assert!(!status.is_up());
    }

    #[tokio::test]
    async fn test_build_failure_surfaces_exit_code() {
        let workspace = tempfile::tempdir().unwrap();
        let driver = LocalDriver::new(Arc::new(LogAggregator::new(10))).unwrap();
        let config = config(workspace.path(), "true", Some("exit 7"));

        let err = driver.build("demo-development-1", &config).await.unwrap_err();
        match err {
            ManagerError::BuildError { exit_code, .. } => assert_eq!(exit_code, Some(7)),
            other => panic!("expected BuildError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_lived_process_probes_crashed() {
        let workspace = tempfile::tempdir().unwrap();
        let aggregator = Arc::new(LogAggregator::new(10));
        let driver = LocalDriver::new(aggregator).unwrap();
        let config = config(workspace.path(), "true", None);

        let artifact = driver.build("demo-development-2", &config).await.unwrap();
        let handle = driver.start("demo-development-2", &artifact, &config).await.unwrap();

        // Wait for the process to exit on its own
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = driver.status(&handle, Duration::from_secs(2)).await.unwrap();
        assert_eq!(status, ProbeStatus::Crashed);
    }
}
