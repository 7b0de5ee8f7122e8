//! Static site deployment driver: stages web assets and serves them with
//! a simple file server process

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::deploy::config::{DeploymentConfig, TargetKind};
use crate::deploy::driver::{BuildArtifact, ProbeStatus, RunningHandle, TargetDriver};
use crate::deploy::local::health_probe;
use crate::deploy::process::ProcessSupervisor;
use crate::errors::ManagerError;
use crate::logstream::{LogAggregator, LogStreamKind};

const STATIC_EXTENSIONS: &[&str] = &["html", "css", "js", "jpg", "png", "gif", "svg", "ico"];

const DEFAULT_PORT: u16 = 8080;

/// Copies a project's static assets into a staging directory and serves
/// them with a supervised file-server process
pub struct StaticDriver {
    supervisor: ProcessSupervisor,
    aggregator: Arc<LogAggregator>,
    staging_dir: PathBuf,
    http: reqwest::Client,
}

impl StaticDriver {
    pub fn new(aggregator: Arc<LogAggregator>, staging_dir: PathBuf) -> Result<Self, ManagerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            supervisor: ProcessSupervisor::new(aggregator.clone()),
            aggregator,
            staging_dir,
            http,
        })
    }
}

fn is_static_asset(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| STATIC_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Copy static assets from `source` into `dest`, preserving relative paths
async fn stage_assets(source: &Path, dest: &Path) -> Result<usize, ManagerError> {
    tokio::fs::create_dir_all(dest).await?;
    let mut copied = 0;
    let mut pending = vec![source.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if is_static_asset(&path) {
                let relative = path
                    .strip_prefix(source)
                    .map_err(|e| ManagerError::Internal(e.to_string()))?;
                let target = dest.join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&path, &target).await?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

#[async_trait]
impl TargetDriver for StaticDriver {
    fn kind(&self) -> TargetKind {
        TargetKind::Static
    }

    async fn build(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> Result<BuildArtifact, ManagerError> {
        if !config.project_dir.exists() {
            return Err(ManagerError::build_failed(
                format!("Project directory does not exist: {}", config.project_dir.display()),
                None,
                "",
            ));
        }

        let staged = self.staging_dir.join(deployment_id);
        let copied = stage_assets(&config.project_dir, &staged).await?;
        info!("Staged {} static assets for {}", copied, deployment_id);

        self.aggregator.append(
            deployment_id,
            LogStreamKind::System,
            format!("Staged {} files into {}", copied, staged.display()),
        );

        Ok(BuildArtifact {
            kind: TargetKind::Static,
            reference: staged.display().to_string(),
            digest: None,
            output: format!("{} files staged", copied),
            built_at: Utc::now(),
        })
    }

    async fn start(
        &self,
        deployment_id: &str,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<RunningHandle, ManagerError> {
        let port = config.port.unwrap_or(DEFAULT_PORT);
        let command = config
            .start_command
            .clone()
            .unwrap_or_else(|| format!("python3 -m http.server {}", port));

        let staged = PathBuf::from(&artifact.reference);
        let pid = self
            .supervisor
            .spawn(deployment_id, &command, &staged, &config.env_vars, Some(port))
            .await?;

        Ok(RunningHandle {
            deployment_id: deployment_id.to_string(),
            kind: TargetKind::Static,
            pid: Some(pid),
            container_name: None,
            url: Some(format!("http://localhost:{}", port)),
            port: Some(port),
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
                None => false,
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
