//! Shared child-process supervision for process-backed drivers

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::deploy::config::EnvVar;
use crate::errors::ManagerError;
use crate::logstream::{LogAggregator, LogStreamKind};

/// Supervises spawned deployment processes: ownership of the `Child`
/// handles, output capture into the log aggregator, and graceful stop.
pub struct ProcessSupervisor {
    children: RwLock<HashMap<String, Arc<Mutex<Child>>>>,
    aggregator: Arc<LogAggregator>,
}

impl ProcessSupervisor {
    pub fn new(aggregator: Arc<LogAggregator>) -> Self {
        Self {
            children: RwLock::new(HashMap::new()),
            aggregator,
        }
    }

    /// Spawn `command_line` through `bash -c` in `cwd`, wiring stdout and
    /// stderr into the deployment's log buffer. Idempotent: if a live child
    /// already exists for this id, its pid is returned instead.
    pub async fn spawn(
        &self,
        deployment_id: &str,
        command_line: &str,
        cwd: &Path,
        env_vars: &BTreeMap<String, EnvVar>,
        port: Option<u16>,
    ) -> Result<u32, ManagerError> {
        if let Some(pid) = self.pid_if_alive(deployment_id).await {
            debug!("Deployment {} already has a live process (pid {})", deployment_id, pid);
            return Ok(pid);
        }

        let mut command = Command::new("bash");
        command
            .args(["-c", command_line])
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, var) in env_vars {
            command.env(name, var.expose());
        }
        if let Some(port) = port {
            command.env("PORT", port.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| ManagerError::StartError(format!("Failed to spawn process: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| ManagerError::StartError("Process exited before it could be tracked".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            self.pump(deployment_id.to_string(), LogStreamKind::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(deployment_id.to_string(), LogStreamKind::Stderr, stderr);
        }

        let mut children = self.children.write().await;
        children.insert(deployment_id.to_string(), Arc::new(Mutex::new(child)));
        Ok(pid)
    }

    fn pump(
        &self,
        deployment_id: String,
        stream: LogStreamKind,
        reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let aggregator = self.aggregator.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                aggregator.append(&deployment_id, stream, line);
            }
        });
    }

    /// Pid of the supervised child, if it is still running
    pub async fn pid_if_alive(&self, deployment_id: &str) -> Option<u32> {
        let slot = {
            let children = self.children.read().await;
            children.get(deployment_id).cloned()
        }?;
        let mut child = slot.lock().await;
        match child.try_wait() {
            Ok(None) => child.id(),
            _ => None,
        }
    }

    /// Whether the child exited on its own (as opposed to never spawned or
    /// already reaped by `stop`)
    pub async fn exited(&self, deployment_id: &str) -> bool {
        let slot = {
            let children = self.children.read().await;
            children.get(deployment_id).cloned()
        };
        match slot {
            Some(slot) => {
                let mut child = slot.lock().await;
                matches!(child.try_wait(), Ok(Some(_)))
            }
            None => false,
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL. The
    /// transition completes regardless of whether force was needed.
    pub async fn stop(&self, deployment_id: &str, grace: Duration) -> Result<(), ManagerError> {
        let slot = {
            let mut children = self.children.write().await;
            children.remove(deployment_id)
        };
        let Some(slot) = slot else {
            // Nothing supervised under this id; treat as already stopped
            return Ok(());
        };

        let mut child = slot.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        if let Some(pid) = child.id() {
            // SIGTERM via kill(1); tokio only exposes SIGKILL directly
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Deployment {} stopped: {}", deployment_id, status);
                Ok(())
            }
            Ok(Err(e)) => Err(ManagerError::StopError(format!("Wait failed: {}", e))),
            Err(_) => {
                warn!("Deployment {} did not stop within {:?}, killing", deployment_id, grace);
                child
                    .start_kill()
                    .map_err(|e| ManagerError::StopError(format!("Kill failed: {}", e)))?;
                let _ = child.wait().await;
                Ok(())
            }
        }
    }
}

/// Run a build command to completion, capturing combined output.
/// A non-zero exit surfaces the exit code and output as a `BuildError`.
pub async fn run_build_command(
    command_line: &str,
    cwd: &Path,
    env_vars: &BTreeMap<String, EnvVar>,
) -> Result<String, ManagerError> {
    let mut command = Command::new("bash");
    command.args(["-c", command_line]).current_dir(cwd);
    for (name, var) in env_vars {
        command.env(name, var.expose());
    }

    let output = command
        .output()
        .await
        .map_err(|e| ManagerError::build_failed(format!("Failed to run build command: {}", e), None, ""))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        Err(ManagerError::build_failed(
            format!("Build command exited with {}", output.status),
            output.status.code(),
            combined,
        ))
    }
}
