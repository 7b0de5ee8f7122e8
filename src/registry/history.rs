//! Append-only deployment history

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::deploy::fsm::DeploymentState;
use crate::errors::ManagerError;
use crate::telemetry::ResourceSample;

/// One immutable history record, appended at every state transition.
/// Keyed by (project, environment, seq) in the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub project: String,
    pub environment: String,

    /// Transition sequence number within the instance, starting at 0
    pub seq: u64,

    pub state: DeploymentState,

    /// Human-readable cause for failed/crashed/stopped transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Captured build tool output, retained for operator inspection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_output: Option<String>,

    /// Last metrics known at the time of the transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceSample>,

    pub recorded_at: DateTime<Utc>,
}

/// Append-only snapshot log with optional JSONL persistence.
///
/// In-memory entries are ordered per instance; the file is only ever
/// appended to, never rewritten, so it remains a complete audit trail.
pub struct HistoryLog {
    entries: RwLock<HashMap<String, Vec<Snapshot>>>,
    file: Option<Mutex<tokio::fs::File>>,
    path: Option<PathBuf>,
}

impl HistoryLog {
    /// In-memory only log (tests, embedders that persist elsewhere)
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            file: None,
            path: None,
        }
    }

    /// Open a persisted log, replaying any existing records
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ManagerError> {
        let path = path.as_ref().to_path_buf();
        let mut entries: HashMap<String, Vec<Snapshot>> = HashMap::new();

        if path.exists() {
            let contents = tokio::fs::read_to_string(&path).await?;
            for (lineno, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Snapshot>(line) {
                    Ok(snapshot) => {
                        entries.entry(snapshot.id.clone()).or_default().push(snapshot);
                    }
                    Err(e) => {
                        // A torn trailing line from a crash is tolerated
                        warn!("Skipping unreadable history record at line {}: {}", lineno + 1, e);
                    }
                }
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            entries: RwLock::new(entries),
            file: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a snapshot. In-memory state is updated even if the disk write
    /// fails; the error is surfaced so the caller can log it.
    pub async fn append(&self, snapshot: Snapshot) -> Result<(), ManagerError> {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(snapshot.id.clone())
                .or_default()
                .push(snapshot.clone());
        }

        if let Some(file) = &self.file {
            let mut line = serde_json::to_string(&snapshot)?;
            line.push('\n');
            let mut file = file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }

        Ok(())
    }

    /// All snapshots for one instance, in transition order
    pub fn for_instance(&self, id: &str) -> Vec<Snapshot> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned().unwrap_or_default()
    }

    /// All snapshots for a project, in recorded order per instance
    pub fn for_project(&self, project: &str) -> Vec<Snapshot> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<Snapshot> = entries
            .values()
            .flatten()
            .filter(|s| s.project == project)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.seq.cmp(&b.seq)));
        snapshots
    }

    /// Number of snapshots recorded for an instance
    pub fn len(&self, id: &str) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, seq: u64, state: DeploymentState) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            project: "demo".to_string(),
            environment: "production".to_string(),
            seq,
            state,
            cause: None,
            url: None,
            build_output: None,
            metrics: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_is_ordered_and_non_decreasing() {
        let log = HistoryLog::in_memory();
        log.append(snapshot("d-1", 0, DeploymentState::Pending)).await.unwrap();
        assert_eq!(log.len("d-1"), 1);
        log.append(snapshot("d-1", 1, DeploymentState::Building)).await.unwrap();
        log.append(snapshot("d-1", 2, DeploymentState::Starting)).await.unwrap();

        let records = log.for_instance("d-1");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[2].state, DeploymentState::Starting);
    }

    #[tokio::test]
    async fn test_persisted_log_replays_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        {
            let log = HistoryLog::open(&path).await.unwrap();
            log.append(snapshot("d-1", 0, DeploymentState::Pending)).await.unwrap();
            log.append(snapshot("d-1", 1, DeploymentState::Building)).await.unwrap();
        }

        let reopened = HistoryLog::open(&path).await.unwrap();
        assert_eq!(reopened.len("d-1"), 2);

        // Appending after reopen extends, never rewrites
        reopened.append(snapshot("d-1", 2, DeploymentState::Failed)).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_for_project_spans_instances() {
        let log = HistoryLog::in_memory();
        log.append(snapshot("d-1", 0, DeploymentState::Pending)).await.unwrap();
        log.append(snapshot("d-2", 0, DeploymentState::Pending)).await.unwrap();

        assert_eq!(log.for_project("demo").len(), 2);
        assert!(log.for_project("other").is_empty());
    }
}
