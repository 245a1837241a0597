//! Worker-lifetime context
//!
//! A [`WorkerContext`] is built once when the worker starts and then serves
//! every mini-batch the host delivers. It owns the mount manager, so dataset
//! resolution happens once per worker and no mount state lives in globals.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::batch::{BatchConfig, BatchReport, BatchRunner, WorkItem};
use crate::config::DriverConfig;
use crate::executor::ItemExecutor;
use crate::pipeline::{prepare_scripts, ProcessLauncher};
use crate::resources::{DatasetRegistry, ReleaseReport, ResourceMountManager, ResourceName};
use crate::{MiniBatchError, Result};

/// Everything a worker keeps between mini-batches
pub struct WorkerContext {
    mounts: Arc<ResourceMountManager>,
    runner: BatchRunner,
    worker_output_root: PathBuf,
}

impl WorkerContext {
    /// Initialise the worker.
    ///
    /// Creates the worker output root, marks the pipeline scripts executable
    /// and resolves all required datasets, failing fast on unknown names.
    #[instrument(skip_all)]
    pub async fn init(
        config: DriverConfig,
        registry: Arc<dyn DatasetRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        let output_root = config.output_root()?.to_path_buf();

        let worker_output_root = &config.worker.worker_output_root;
        tokio::fs::create_dir_all(worker_output_root)
            .await
            .map_err(|source| MiniBatchError::WorkingArea {
                path: worker_output_root.clone(),
                source,
            })?;
        let worker_output_root = tokio::fs::canonicalize(worker_output_root).await?;

        prepare_scripts(&config.pipeline).await?;

        let mounts = Arc::new(ResourceMountManager::new(registry));
        let resolved = mounts.resolve(&ResourceName::REQUIRED).await?;
        for resource in &resolved {
            info!(dataset = %resource.name, "Added dataset");
        }

        let batch_config = BatchConfig {
            concurrency_limit: config.worker.concurrency_limit,
            item_timeout: config.pipeline.timeout,
        };
        let executor = ItemExecutor::new(config.pipeline, launcher);
        let runner = BatchRunner::new(executor, output_root, worker_output_root.clone())
            .with_config(batch_config);

        info!(worker_output_root = %worker_output_root.display(), "Worker init complete");
        Ok(Self {
            mounts,
            runner,
            worker_output_root,
        })
    }

    /// Run a mini-batch of input paths
    pub async fn run_batch(&self, inputs: Vec<PathBuf>) -> Result<BatchReport> {
        self.run_batch_with_cancel(inputs, &CancellationToken::new())
            .await
    }

    /// Run a mini-batch that the host can cancel
    pub async fn run_batch_with_cancel(
        &self,
        inputs: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let items: Vec<WorkItem> = inputs.into_iter().map(WorkItem::new).collect();
        self.runner.run_batch(&self.mounts, &items, cancel).await
    }

    /// Mount manager shared by all mini-batches
    pub fn mounts(&self) -> &Arc<ResourceMountManager> {
        &self.mounts
    }

    /// Root of the per-item working areas
    pub fn worker_output_root(&self) -> &PathBuf {
        &self.worker_output_root
    }

    /// Release anything still mounted before the worker exits
    pub async fn shutdown(&self) -> ReleaseReport {
        let report = self.mounts.release().await;
        info!(released = report.total(), "Worker shut down");
        report
    }
}
