//! Storage layout for the deployment manager

use std::path::PathBuf;

use crate::errors::ManagerError;

/// On-disk layout for deployment state, packages and staged sites
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Append-only deployment history, one JSON snapshot per line
    pub fn history_file(&self) -> PathBuf {
        self.base_dir.join("history.jsonl")
    }

    /// Cloud deployment packages (tarballs)
    pub fn packages_dir(&self) -> PathBuf {
        self.base_dir.join("packages")
    }

    /// Staged static sites, one subdirectory per deployment id
    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join("staging")
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ManagerError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        tokio::fs::create_dir_all(self.packages_dir()).await?;
        tokio::fs::create_dir_all(self.staging_dir()).await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/deployd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = PathBuf::from(".deployd");

        Self { base_dir }
    }
}
