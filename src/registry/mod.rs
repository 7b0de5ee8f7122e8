//! Deployment registry: the single source of truth for instance state

pub mod history;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::deploy::config::{DeploymentConfig, EnvKind, TargetKind};
use crate::deploy::driver::{BuildArtifact, RunningHandle};
use crate::deploy::fsm::DeploymentState;
use crate::errors::ManagerError;
use crate::telemetry::ResourceSample;

/// One concrete deployment attempt, owned by the registry.
///
/// Mutated only through `DeploymentRegistry::update`; everything handed out
/// by `get`/`list` is a cloned snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentInstance {
    /// `{project}-{environment}-{timestamp}`, globally unique
    pub id: String,

    pub config: DeploymentConfig,

    pub state: DeploymentState,

    /// Set once the instance reaches running
    pub url: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,

    /// Cause of the last failed or crashed transition
    pub last_error: Option<String>,

    /// Build artifact, retained across failures for operator inspection
    pub artifact: Option<BuildArtifact>,

    pub handle: Option<RunningHandle>,

    pub last_metrics: Option<ResourceSample>,

    /// Bumped on every recorded transition
    pub transition_seq: u64,

    /// Superseded or explicitly removed from the active listing
    pub archived: bool,

    /// Stop requested while a driver call was in flight; honored as soon as
    /// the call returns
    pub stop_requested: bool,
}

impl DeploymentInstance {
    pub fn new(id: String, config: DeploymentConfig) -> Self {
        Self {
            id,
            config,
            state: DeploymentState::Pending,
            url: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_error: None,
            artifact: None,
            handle: None,
            last_metrics: None,
            transition_seq: 0,
            archived: false,
            stop_requested: false,
        }
    }
}

/// Filter for `DeploymentRegistry::list`
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project: Option<String>,
    pub state: Option<DeploymentState>,
    pub include_archived: bool,
}

/// Registry of all deployment instances.
///
/// Each instance sits behind its own mutex: a mutation for id X queues
/// behind in-flight mutations for X but never blocks id Y. The port table
/// is the one piece of cross-instance state, guarded separately with a
/// transactional check-and-set.
pub struct DeploymentRegistry {
    instances: RwLock<HashMap<String, Arc<Mutex<DeploymentInstance>>>>,
    /// Insertion order for `list`
    order: std::sync::Mutex<Vec<String>>,
    /// (kind, port) -> holding deployment id
    ports: std::sync::Mutex<HashMap<(TargetKind, u16), String>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            order: std::sync::Mutex::new(Vec::new()),
            ports: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a new instance. Ids are unique; re-registration is an error.
    pub async fn register(&self, instance: DeploymentInstance) -> Result<(), ManagerError> {
        let id = instance.id.clone();
        let mut instances = self.instances.write().await;
        if instances.contains_key(&id) {
            return Err(ManagerError::ConflictError(format!(
                "Deployment id already registered: {}",
                id
            )));
        }
        instances.insert(id.clone(), Arc::new(Mutex::new(instance)));
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
        Ok(())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.instances.read().await.contains_key(id)
    }

    /// Snapshot of one instance
    pub async fn get(&self, id: &str) -> Option<DeploymentInstance> {
        let slot = {
            let instances = self.instances.read().await;
            instances.get(id).cloned()
        };
        match slot {
            Some(slot) => Some(slot.lock().await.clone()),
            None => None,
        }
    }

    /// Snapshots of all matching instances, in registration order
    pub async fn list(&self, filter: &ListFilter) -> Vec<DeploymentInstance> {
        let ids: Vec<String> = self
            .order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut out = Vec::new();
        for id in ids {
            if let Some(instance) = self.get(&id).await {
                if instance.archived && !filter.include_archived {
                    continue;
                }
                if let Some(project) = &filter.project {
                    if &instance.config.project_name != project {
                        continue;
                    }
                }
                if let Some(state) = filter.state {
                    if instance.state != state {
                        continue;
                    }
                }
                out.push(instance);
            }
        }
        out
    }

    /// Mutate one instance under its own lock, returning the mutator's value.
    /// The lock is held only for the duration of the closure.
    pub async fn update<R>(
        &self,
        id: &str,
        mutator: impl FnOnce(&mut DeploymentInstance) -> R,
    ) -> Result<R, ManagerError> {
        let slot = {
            let instances = self.instances.read().await;
            instances
                .get(id)
                .cloned()
                .ok_or_else(|| ManagerError::NotFound(format!("Deployment not found: {}", id)))?
        };
        let mut instance = slot.lock().await;
        Ok(mutator(&mut instance))
    }

    /// Reserve a port for `id`: transactional check-and-set. Succeeds when
    /// the slot is free or already held by the same id (restart path).
    pub fn reserve_port(&self, kind: TargetKind, port: u16, id: &str) -> bool {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        match ports.get(&(kind, port)) {
            Some(holder) if holder != id => false,
            _ => {
                ports.insert((kind, port), id.to_string());
                true
            }
        }
    }

    /// Release a port if held by `id`
    pub fn release_port(&self, kind: TargetKind, port: u16, id: &str) {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        if ports.get(&(kind, port)).map(|h| h.as_str()) == Some(id) {
            ports.remove(&(kind, port));
        }
    }

    /// Snapshot of reserved ports, used by the validator
    pub fn port_snapshot(&self) -> HashSet<(TargetKind, u16)> {
        let ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.keys().copied().collect()
    }

    /// Id of an instance currently occupying the (project, environment, port)
    /// slot in building/starting/running/stopping, if any.
    pub async fn active_conflict(
        &self,
        project: &str,
        environment: &EnvKind,
        port: Option<u16>,
    ) -> Option<String> {
        let filter = ListFilter::default();
        for instance in self.list(&filter).await {
            if instance.state.is_active()
                && instance.config.project_name == project
                && &instance.config.environment == environment
                && instance.config.port == port
            {
                return Some(instance.id);
            }
        }
        None
    }

    /// Archive prior instances of the same project+environment pair.
    /// Archived instances stay in history; their ports are released.
    /// Returns the archived ids.
    pub async fn archive_superseded(
        &self,
        project: &str,
        environment: &EnvKind,
        superseded_by: &str,
    ) -> Vec<String> {
        let filter = ListFilter::default();
        let mut archived = Vec::new();
        for instance in self.list(&filter).await {
            if instance.id != superseded_by
                && !instance.state.is_active()
                && instance.config.project_name == project
                && &instance.config.environment == environment
            {
                let _ = self.update(&instance.id, |inst| inst.archived = true).await;
                if let Some(port) = instance.config.port {
                    self.release_port(instance.config.target, port, &instance.id);
                }
                archived.push(instance.id);
            }
        }
        archived
    }
}

impl Default for DeploymentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
