//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::driver::driver_map;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::ManagerError;
use crate::logstream::LogAggregator;
use crate::registry::history::HistoryLog;
use crate::registry::{DeploymentRegistry, ListFilter};
use crate::telemetry::MetricsSampler;

/// Main application state
pub struct AppState {
    /// Registry of all deployment instances
    pub registry: Arc<DeploymentRegistry>,

    /// Per-deployment log buffers
    pub aggregator: Arc<LogAggregator>,

    /// Append-only transition history
    pub history: Arc<HistoryLog>,

    /// Lifecycle orchestrator
    pub orchestrator: Arc<Orchestrator>,

    /// Resource usage sampler
    pub sampler: Arc<MetricsSampler>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, ManagerError> {
        info!("Initializing application state...");

        options.storage.layout.setup().await?;
        tokio::fs::create_dir_all(&options.workspace).await?;

        let registry = Arc::new(DeploymentRegistry::new());
        let aggregator = Arc::new(LogAggregator::new(options.log_buffer_capacity));
        let history = Arc::new(HistoryLog::open(options.storage.layout.history_file()).await?);
        let drivers = driver_map(aggregator.clone(), &options.storage.layout)?;

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            drivers,
            aggregator.clone(),
            history.clone(),
            options.orchestrator.clone(),
            options.workspace.clone(),
        ));

        let sampler = Arc::new(MetricsSampler::new());

        Ok(Self {
            registry,
            aggregator,
            history,
            orchestrator,
            sampler,
        })
    }

    /// Shutdown application state, stopping whatever is still running.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        info!("Shutting down application state...");

        let instances = self.registry.list(&ListFilter::default()).await;
        for instance in instances {
            if !instance.state.is_active() {
                continue;
            }
            if let Err(e) = self.orchestrator.stop(&instance.id).await {
                warn!("Failed to stop {} during shutdown: {}", instance.id, e);
            }
        }

        Ok(())
    }
}
