//! # Mini-batch inference driver
//!
//! Runs an external, per-item computation pipeline (a protein-structure
//! prediction tool) over a worker-local shard of input files.
//!
//! ## Overview
//!
//! A batch-scheduling host hands each worker a *mini-batch*: an ordered list of
//! input paths. For every mini-batch the driver
//!
//! 1. mounts the large read-only shared datasets the pipeline needs,
//! 2. gives each input its own working area and runs the pipeline there,
//! 3. copies the artifact the pipeline produced into the host's output root,
//! 4. unmounts the datasets, whatever happened to the individual items.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use minibatch::config::DriverConfig;
//! use minibatch::pipeline::TokioProcessLauncher;
//! use minibatch::resources::LocalDirectoryRegistry;
//! use minibatch::worker::WorkerContext;
//!
//! # async fn example() -> minibatch::Result<()> {
//! let config = DriverConfig::load(Some("minibatch.yaml"))?;
//! let registry = Arc::new(LocalDirectoryRegistry::new(config.datasets.clone()));
//! let worker = WorkerContext::init(config, registry, Arc::new(TokioProcessLauncher::new())).await?;
//!
//! let report = worker.run_batch(vec!["inputs/a.fa".into(), "inputs/b.fa".into()]).await?;
//! for line in report.status_lines() {
//!     println!("{line}");
//! }
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`resources`]: dataset registry seam and the mount manager
//! - [`pipeline`]: invocation contract of the external pipeline and process launching
//! - [`executor`]: per-item execution in an isolated working area
//! - [`batch`]: mini-batch lifecycle, relocation and per-item status
//! - [`worker`]: worker-lifetime context tying the pieces together
//! - [`config`], [`logging`], [`metrics`]: ambient plumbing

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::path::PathBuf;

use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, MiniBatchError>;

/// Errors that abort a whole mini-batch.
///
/// Per-item failures (non-zero exit, launch failure, missing artifact) are
/// never reported through this type; they are recorded in the item's status.
#[derive(Error, Debug)]
pub enum MiniBatchError {
    /// Dataset resolution or mount failure
    #[error("Resource error: {0}")]
    Resource(#[from] resources::ResourceError),

    /// A working area could not be created (disk full, permissions, ...)
    #[error("Failed to create working area {path}: {source}")]
    WorkingArea {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying filesystem error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Pipeline preparation failure at worker init
    #[error("Pipeline setup error: {0}")]
    PipelineSetup(String),

    /// Filesystem error outside of item execution
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Mini-batch lifecycle, per-item status and relocation
pub mod batch;

/// Configuration loading
pub mod config;

/// Per-item execution
pub mod executor;

/// Tracing subscriber setup
pub mod logging;

/// Prometheus metrics
pub mod metrics;

/// External pipeline invocation
pub mod pipeline;

/// Shared dataset resolution and mounting
pub mod resources;

/// Worker-lifetime context
pub mod worker;
