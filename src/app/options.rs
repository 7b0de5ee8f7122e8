//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::orchestrator::OrchestratorSettings;
use crate::storage::layout::StorageLayout;
use crate::workers::monitor;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Directory containing project sources, one subdirectory per project
    pub workspace: PathBuf,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable the monitor worker
    pub enable_monitor: bool,

    /// Monitor worker options
    pub monitor: monitor::Options,

    /// Orchestrator timeouts and policy
    pub orchestrator: OrchestratorSettings,

    /// Retained log lines per deployment
    pub log_buffer_capacity: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            workspace: PathBuf::from("."),
            storage: StorageOptions::default(),
            enable_monitor: true,
            monitor: monitor::Options::default(),
            orchestrator: OrchestratorSettings::default(),
            log_buffer_capacity: 1000,
        }
    }
}

/// Lifecycle options for the manager process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
        }
    }
}
