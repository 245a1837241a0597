//! Shared dataset resolution and mounting
//!
//! The pipeline reads four large, read-only datasets (model weights and three
//! reference databases). They are resolved against a [`DatasetRegistry`] once
//! per worker and mounted for the duration of a mini-batch by the
//! [`ResourceMountManager`].

mod local;
mod manager;

pub use local::{LocalDirectoryDataset, LocalDirectoryRegistry};
pub use manager::{MountLease, ResourceMountManager};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors related to dataset resolution and mounting
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// Name unknown to the registry
    #[error("Dataset not found in registry: {0}")]
    Resolution(String),

    /// Mount could not be started
    #[error("Failed to mount {resource}: {message}")]
    Mount {
        /// Dataset name
        resource: String,
        /// Backend error
        message: String,
    },

    /// Mount could not be stopped
    #[error("Failed to unmount {resource}: {message}")]
    Unmount {
        /// Dataset name
        resource: String,
        /// Backend error
        message: String,
    },

    /// Dataset has no active mount
    #[error("Dataset is not mounted: {0}")]
    NotMounted(String),
}

/// The shared datasets the pipeline's fixed invocation requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceName {
    /// Network weights
    #[serde(rename = "rosettafold_weights")]
    Weights,
    /// BFD sequence database
    #[serde(rename = "rosettafold_bfd")]
    Bfd,
    /// UniRef sequence database
    #[serde(rename = "rosettafold_UniRef")]
    UniRef,
    /// PDB template database
    #[serde(rename = "rosettafold_pdb")]
    Pdb,
}

impl ResourceName {
    /// Every dataset a mini-batch needs mounted
    pub const REQUIRED: [ResourceName; 4] = [
        ResourceName::Weights,
        ResourceName::Bfd,
        ResourceName::UniRef,
        ResourceName::Pdb,
    ];

    /// Name of the dataset in the registry
    pub fn dataset_name(&self) -> &'static str {
        match self {
            ResourceName::Weights => "rosettafold_weights",
            ResourceName::Bfd => "rosettafold_bfd",
            ResourceName::UniRef => "rosettafold_UniRef",
            ResourceName::Pdb => "rosettafold_pdb",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dataset_name())
    }
}

impl FromStr for ResourceName {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceName::REQUIRED
            .into_iter()
            .find(|name| name.dataset_name() == s)
            .ok_or_else(|| ResourceError::Resolution(s.to_string()))
    }
}

/// Resolves dataset names to mountable datasets
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    /// Look up a dataset by its registry name
    async fn resolve(&self, name: &str) -> Result<Arc<dyn MountableDataset>, ResourceError>;
}

/// A dataset that can be mounted locally
#[async_trait]
pub trait MountableDataset: Send + Sync + fmt::Debug {
    /// Registry name of the dataset
    fn name(&self) -> &str;

    /// Create a mount context; nothing is mounted until [`MountContext::start`]
    async fn mount(&self) -> Result<Box<dyn MountContext>, ResourceError>;
}

/// A live or pending mount of one dataset
#[async_trait]
pub trait MountContext: Send + Sync {
    /// Make the dataset readable at [`MountContext::mount_point`]
    async fn start(&mut self) -> Result<(), ResourceError>;

    /// Tear the mount down
    async fn stop(&mut self) -> Result<(), ResourceError>;

    /// Local path the dataset is readable at
    fn mount_point(&self) -> &Path;
}

/// A dataset resolved from the registry; immutable for the worker's life
#[derive(Debug, Clone)]
pub struct SharedResource {
    /// Which required dataset this is
    pub name: ResourceName,
    /// Registry handle used to create mounts
    pub handle: Arc<dyn MountableDataset>,
}

/// Lifecycle state of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    /// No mount exists
    Unmounted,
    /// Start in progress
    Mounting,
    /// Readable at its mount point
    Mounted,
    /// Stop in progress or interrupted
    Unmounting,
}

/// Snapshot of one entry in the mount table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MountHandle {
    /// Dataset this mount belongs to
    pub resource: ResourceName,
    /// Local path the dataset is readable at
    pub mount_point: PathBuf,
    /// Current lifecycle state
    pub state: MountState,
}

/// Active mount points of a mini-batch, keyed by dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MountSet {
    paths: BTreeMap<ResourceName, PathBuf>,
}

impl MountSet {
    pub(crate) fn insert(&mut self, name: ResourceName, path: PathBuf) {
        self.paths.insert(name, path);
    }

    /// Mount point of a dataset
    pub fn path(&self, name: ResourceName) -> Result<&Path, ResourceError> {
        self.paths
            .get(&name)
            .map(PathBuf::as_path)
            .ok_or_else(|| ResourceError::NotMounted(name.to_string()))
    }

    /// Number of mounted datasets
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether no dataset is mounted
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Iterate over `(dataset, mount point)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (ResourceName, &Path)> {
        self.paths.iter().map(|(name, path)| (*name, path.as_path()))
    }
}

impl FromIterator<(ResourceName, PathBuf)> for MountSet {
    fn from_iter<I: IntoIterator<Item = (ResourceName, PathBuf)>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

/// A mount that failed to stop during release
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmountFailure {
    /// Dataset whose unmount failed
    pub resource: ResourceName,
    /// Where it was mounted
    pub mount_point: PathBuf,
    /// Backend error
    pub message: String,
}

/// Outcome of one release pass over the mount table
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReleaseReport {
    /// Datasets unmounted cleanly
    pub released: Vec<ResourceName>,
    /// Datasets whose unmount failed; they are no longer tracked as mounted
    pub failures: Vec<UnmountFailure>,
}

impl ReleaseReport {
    /// True when every unmount succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of handles the release pass touched
    pub fn total(&self) -> usize {
        self.released.len() + self.failures.len()
    }
}
