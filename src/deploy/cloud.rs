//! Cloud deployment driver: packages the project and simulates the
//! provider upload (real provider SDK integration is out of scope)

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::info;

use crate::deploy::config::{DeploymentConfig, TargetKind};
use crate::deploy::driver::{BuildArtifact, ProbeStatus, RunningHandle, TargetDriver};
use crate::errors::ManagerError;
use crate::logstream::{LogAggregator, LogStreamKind};

const PROVIDER_DOMAIN: &str = "deployd.cloud";

/// Packages the project into a tarball and tracks simulated provider state
pub struct CloudDriver {
    aggregator: Arc<LogAggregator>,
    packages_dir: PathBuf,
    /// Deployment ids the provider currently reports as live
    active: RwLock<HashSet<String>>,
}

impl CloudDriver {
    pub fn new(aggregator: Arc<LogAggregator>, packages_dir: PathBuf) -> Self {
        Self {
            aggregator,
            packages_dir,
            active: RwLock::new(HashSet::new()),
        }
    }

    fn is_active(&self, deployment_id: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(deployment_id)
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{:02x}", b);
            acc
        })
}

#[async_trait]
impl TargetDriver for CloudDriver {
    fn kind(&self) -> TargetKind {
        TargetKind::Cloud
    }

    async fn build(
        &self,
        deployment_id: &str,
        config: &DeploymentConfig,
    ) -> Result<BuildArtifact, ManagerError> {
        tokio::fs::create_dir_all(&self.packages_dir).await?;
        let package = self.packages_dir.join(format!("{}.tar.gz", deployment_id));

        info!("Packaging {} for cloud deployment", config.project_name);
        let output = Command::new("tar")
            .arg("-czf")
            .arg(&package)
            .arg("-C")
            .arg(&config.project_dir)
            .arg(".")
            .output()
            .await
            .map_err(|e| ManagerError::build_failed(format!("Failed to run tar: {}", e), None, ""))?;

        if !output.status.success() {
            return Err(ManagerError::build_failed(
                format!("tar exited with {}", output.status),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let bytes = tokio::fs::read(&package).await?;
        let digest = hex_digest(&bytes);
        self.aggregator.append(
            deployment_id,
            LogStreamKind::System,
            format!("Packaged {} ({} bytes, sha256 {})", package.display(), bytes.len(), &digest[..12]),
        );

        Ok(BuildArtifact {
            kind: TargetKind::Cloud,
            reference: package.display().to_string(),
            digest: Some(digest),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
            built_at: Utc::now(),
        })
    }

    async fn start(
        &self,
        deployment_id: &str,
        artifact: &BuildArtifact,
        config: &DeploymentConfig,
    ) -> Result<RunningHandle, ManagerError> {
        // The credentials handle stays opaque; only its presence is checked
        if config.credentials_ref.as_deref().unwrap_or("").is_empty() {
            return Err(ManagerError::StartError(
                "Cloud start without credentials reference".to_string(),
            ));
        }

        let url = format!("https://{}-{}.{}", config.project_name, deployment_id, PROVIDER_DOMAIN);

        {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            if !active.insert(deployment_id.to_string()) {
                info!("Cloud deployment {} already live", deployment_id);
            }
        }

        self.aggregator.append(
            deployment_id,
            LogStreamKind::System,
            format!("Uploading package {}", artifact.reference),
        );
        self.aggregator.append(
            deployment_id,
            LogStreamKind::System,
            format!("Provider accepted revision, serving at {}", url),
        );

        Ok(RunningHandle {
            deployment_id: deployment_id.to_string(),
            kind: TargetKind::Cloud,
            pid: None,
            container_name: None,
            url: Some(url),
            port: config.port,
            health_check_url: config.health_check_url.as_ref().map(|u| u.to_string()),
        })
    }

    async fn stop(&self, handle: &RunningHandle, _grace: Duration) -> Result<(), ManagerError> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        active.remove(&handle.deployment_id);
        self.aggregator.append(
            &handle.deployment_id,
            LogStreamKind::System,
            "Provider deployment taken down".to_string(),
        );
        Ok(())
    }

    async fn status(
        &self,
        handle: &RunningHandle,
        _timeout: Duration,
    ) -> Result<ProbeStatus, ManagerError> {
        Ok(if self.is_active(&handle.deployment_id) {
            ProbeStatus::Running
        } else {
            ProbeStatus::Stopped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as StdHashSet;
    use std::path::Path;

    fn config(project_dir: &Path) -> DeploymentConfig {
        let raw = crate::deploy::config::RawDeployRequest {
            project_name: "demo".to_string(),
            target: "cloud".to_string(),
            environment: "production".to_string(),
            port: None,
            env: vec![],
            build_command: None,
            start_command: None,
            build_context: None,
            credentials_ref: Some("vault://deploy/prod".to_string()),
            health_check_url: None,
        };
        let mut config =
            crate::deploy::config::validate(raw, project_dir.parent().unwrap(), &StdHashSet::new()).unwrap();
        config.project_dir = project_dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_build_packages_and_digests() {
        let workspace = tempfile::tempdir().unwrap();
        let project = workspace.path().join("demo");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("index.html"), "<html></html>").unwrap();

        let packages = tempfile::tempdir().unwrap();
        let driver = CloudDriver::new(Arc::new(LogAggregator::new(10)), packages.path().to_path_buf());

        let artifact = driver.build("demo-production-1", &config(&project)).await.unwrap();
        assert!(Path::new(&artifact.reference).exists());
        assert_eq!(artifact.digest.as_ref().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_start_stop_status_roundtrip() {
        let workspace = tempfile::tempdir().unwrap();
        let project = workspace.path().join("demo");
        std::fs::create_dir(&project).unwrap();

        let packages = tempfile::tempdir().unwrap();
        let driver = CloudDriver::new(Arc::new(LogAggregator::new(10)), packages.path().to_path_buf());
        let config = config(&project);

        let artifact = driver.build("demo-production-2", &config).await.unwrap();
        let handle = driver.start("demo-production-2", &artifact, &config).await.unwrap();
        assert!(handle.url.as_ref().unwrap().starts_with("https://demo-"));

        let status = driver.status(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeStatus::Running);

        driver.stop(&handle, Duration::from_secs(1)).await.unwrap();
        let status = driver.status(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeStatus::Stopped);
    }
}
