//! Docker container deployment driver

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::config::{DeploymentConfig, TargetKind};
use crate::deploy::driver::{BuildArtifact, ProbeStatus, RunningHandle, TargetDriver};
use crate::deploy::local::health_probe;
use crate::errors::ManagerError;
use crate::logstream::{LogAggregator, LogStreamKind};

/// Runs a project as a Docker container
pub struct ContainerDriver {
    aggregator: Arc<LogAggregator>,
    http: reqwest::Client,
}

impl ContainerDriver {
    pub fn new(aggregator: Arc<LogAggregator>) -> Result<Self, ManagerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { aggregator, http })
    }

    /// Id of the running container for a deployment, if any
    async fn running_container(&self, name: &str) -> Result<Option<String>, ManagerError> {
        let output = Command::new("docker")
            .args(["ps", "-q", "-f", &format!("name={}", name)])
            .output()
            .await
            .map_err(|e| ManagerError::Internal(format!("Failed to run docker ps: {}", e)))?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    /// Whether an exited container with this name still exists
    async fn exited_container(&self, name: &str) -> bool {
        let output = Command::new("docker")
            .args(["ps", "-aq", "-f", &format!("name={}", name)])
            .output()
            .await;
        match output {
            Ok(out) => !String::from_utf8_lossy(&out.stdout).trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Follow the container's log stream into the aggregator
    fn pump_logs(&self, deployment_id: String, container_name: String) {
        let aggregator = self.aggregator.clone();
        tokio::spawn(async move {
            let child = Command::new("docker")
                .args(["logs", "-f", &container_name])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();
            let Ok(mut child) = child else { return };

            let mut tasks = Vec::new();
            if let Some(stdout) = child.stdout.take() {
                let agg = aggregator.clone();
                let id = deployment_id.clone();
                tasks.push(tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        agg.append(&id, LogStreamKind::Stdout, line);
                    }
                }));
            }
            if let Some(stderr) = child.stderr.take() {
                tasks.push(tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        aggregator.append(&deployment_id, LogStreamKind::Stderr, line);
                    }
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
            let _ = child.wait().await;
        });
    }
}

/// Generate a fallback Dockerfile for contexts that ship none
pub(crate) fn generate_dockerfile(config: &DeploymentConfig) -> String {
    let port = config.port.unwrap_or(8080);
    let start = config
        .start_command
        .as_deref()
        .unwrap_or("python3 app.py");
    format!(
        "FROM python:3.12-slim\n\n\
         WORKDIR /app\n\n\
         COPY . /app\n\n\
         RUN pip install --no-cache-dir -r requirements.txt || true\n\n\
         EXPOSE {port}\n\n\
         ENV PORT={port}\n\n\
         CMD {start}\n"
    )
}

#[async_trait]
impl TargetDriver for ContainerDriver {
    fn kind(&self) -> TargetKind {
        TargetKind::Container
    }

    async fn build(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> Result<BuildArtifact, ManagerError> {
        let context: &Path = config
            .build_context
            .as_deref()
            .ok_or_else(|| ManagerError::ConfigError("Container target without build context".to_string()))?;

        let dockerfile = context.join("Dockerfile");
        if !dockerfile.exists() {
            debug!("No Dockerfile in {}, generating one", context.display());
            tokio::fs::write(&dockerfile, generate_dockerfile(config)).await?;
        }

        let image = format!("deployd/{}:{}", config.project_name, deployment_id);
        info!("Building Docker image: {}", image);

        let output = Command::new("docker")
            .args(["build", "-t", &image])
            .arg(context)
            .output()
            .await
            .map_err(|e| ManagerError::build_failed(format!("Failed to run docker build: {}", e), None, ""))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ManagerError::build_failed(
                format!("docker build exited with {}", output.status),
                output.status.code(),
                combined,
            ));
        }

        self.aggregator.append(
            deployment_id,
            LogStreamKind::System,
            format!("Built image {}", image),
        );

        Ok(BuildArtifact {
            kind: TargetKind::Container,
            reference: image,
            digest: None,
            output: combined,
            built_at: Utc::now(),
        })
    }

    async fn start(
        &self,
        deployment_id: &str,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<RunningHandle, ManagerError> {
        let url = config.port.map(|p| format!("http://localhost:{}", p));

        // Idempotent against double-start
        if self.running_container(deployment_id).await?.is_some() {
            debug!("Container {} already running", deployment_id);
            return Ok(RunningHandle {
                deployment_id: deployment_id.to_string(),
                kind: TargetKind::Container,
                pid: None,
                container_name: Some(deployment_id.to_string()),
                url,
                port: config.port,
                health_check_url: config.health_check_url.as_ref().map(|u| u.to_string()),
            });
        }

        let mut command = Command::new("docker");
        command.args(["run", "-d", "--name", deployment_id]);
        if let Some(port) = config.port {
            command.args(["-p", &format!("{}:{}", port, port)]);
            command.args(["-e", &format!("PORT={}", port)]);
        }
        for (name, var) in &config.env_vars {
            command.args(["-e", &format!("{}={}", name, var.expose())]);
        }
        command.arg(&artifact.reference);

        info!("Starting container {} from {}", deployment_id, artifact.reference);
        let output = command
            .output()
            .await
            .map_err(|e| ManagerError::StartError(format!("Failed to run docker run: {}", e)))?;

        if !output.status.success() {
            return Err(ManagerError::StartError(format!(
                "docker run exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.pump_logs(deployment_id.to_string(), deployment_id.to_string());

        Ok(RunningHandle {
            deployment_id: deployment_id.to_string(),
            kind: TargetKind::Container,
            pid: None,
            container_name: Some(deployment_id.to_string()),
            url,
            port: config.port,
            health_check_url: config.health_check_url.as_ref().map(|u| u.to_string()),
        })
    }

    async fn stop(&self, handle: &RunningHandle, grace: Duration) -> Result<(), ManagerError> {
        let name = handle
            .container_name
            .as_deref()
            .unwrap_or(&handle.deployment_id);

        let status = Command::new("docker")
            .args(["stop", "-t", &grace.as_secs().to_string(), name])
            .status()
            .await
            .map_err(|e| ManagerError::StopError(format!("Failed to run docker stop: {}", e)))?;
        if !status.success() && self.running_container(name).await?.is_some() {
            return Err(ManagerError::StopError(format!("docker stop failed for {}", name)));
        }

        let _ = Command::new("docker").args(["rm", name]).status().await;
        Ok(())
    }

    async fn status(
        &self,
        handle: &RunningHandle,
        timeout: Duration,
    ) -> Result<ProbeStatus, ManagerError> {
        let name = handle
            .container_name
            .as_deref()
            .unwrap_or(&handle.deployment_id);

        let probe = async {
            if self.running_container(name).await?.is_some() {
                return Ok(match &handle.health_check_url {
                    Some(url) => health_probe(&self.http, url).await,
                    None => ProbeStatus::Running,
                });
            }
            // Exited container still present: died rather than stopped, since
            // an orchestrated stop removes the container
            if self.exited_container(name).await {
                Ok(ProbeStatus::Crashed)
            } else {
                Ok(ProbeStatus::Stopped)
            }
        };

        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| ManagerError::ProbeTimeout(timeout))?
    }
}
