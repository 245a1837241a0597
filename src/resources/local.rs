use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DatasetRegistry, MountContext, MountableDataset, ResourceError};

/// Registry of datasets that are already staged as local directories.
///
/// Mounting checks that the directory is there and readable as a directory;
/// unmounting only flips the mount's state.
#[derive(Debug, Clone, Default)]
pub struct LocalDirectoryRegistry {
    datasets: HashMap<String, PathBuf>,
}

impl LocalDirectoryRegistry {
    /// Create a registry from a `name -> directory` table
    pub fn new(datasets: HashMap<String, PathBuf>) -> Self {
        Self { datasets }
    }

    /// Register one more dataset
    pub fn with_dataset(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.datasets.insert(name.into(), path.into());
        self
    }
}

#[async_trait]
impl DatasetRegistry for LocalDirectoryRegistry {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn MountableDataset>, ResourceError> {
        let path = self
            .datasets
            .get(name)
            .ok_or_else(|| ResourceError::Resolution(name.to_string()))?;

        Ok(Arc::new(LocalDirectoryDataset {
            name: name.to_string(),
            path: path.clone(),
        }))
    }
}

/// A dataset backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalDirectoryDataset {
    name: String,
    path: PathBuf,
}

#[async_trait]
impl MountableDataset for LocalDirectoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mount(&self) -> Result<Box<dyn MountContext>, ResourceError> {
        Ok(Box::new(LocalDirectoryMount {
            name: self.name.clone(),
            path: self.path.clone(),
            active: false,
        }))
    }
}

struct LocalDirectoryMount {
    name: String,
    path: PathBuf,
    active: bool,
}

#[async_trait]
impl MountContext for LocalDirectoryMount {
    async fn start(&mut self) -> Result<(), ResourceError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| ResourceError::Mount {
                resource: self.name.clone(),
                message: format!("{}: {}", self.path.display(), e),
            })?;

        if !metadata.is_dir() {
            return Err(ResourceError::Mount {
                resource: self.name.clone(),
                message: format!("{} is not a directory", self.path.display()),
            });
        }

        self.active = true;
        debug!(dataset = %self.name, path = %self.path.display(), "Local dataset mounted");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ResourceError> {
        if !self.active {
            return Err(ResourceError::Unmount {
                resource: self.name.clone(),
                message: "not mounted".to_string(),
            });
        }
        self.active = false;
        Ok(())
    }

    fn mount_point(&self) -> &Path {
        &self.path
    }
}
