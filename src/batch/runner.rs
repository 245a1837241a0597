//! Mini-batch runner
//!
//! Owns the lifecycle of one mini-batch:
//! - mounts the shared datasets once for the whole batch
//! - runs every item, sequentially or with bounded concurrency
//! - copies produced artifacts into the host output root
//! - releases the mounts on every exit path

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::types::*;
use crate::executor::ItemExecutor;
use crate::metrics::DriverMetrics;
use crate::resources::{MountSet, ResourceMountManager, ResourceName};
use crate::{MiniBatchError, Result};

/// Callback for progress updates: `(completed, total)`
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Runs mini-batches against a worker's mount manager
pub struct BatchRunner {
    executor: ItemExecutor,
    /// Host-designated root receiving `<identifier>/<artifact>`
    output_root: PathBuf,
    /// Worker-local root holding the working areas
    worker_output_root: PathBuf,
    concurrency_limit: usize,
    progress_callback: Option<Arc<ProgressCallback>>,
}

impl BatchRunner {
    /// Create a sequential runner
    pub fn new(
        executor: ItemExecutor,
        output_root: impl Into<PathBuf>,
        worker_output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            output_root: output_root.into(),
            worker_output_root: worker_output_root.into(),
            concurrency_limit: 1,
            progress_callback: None,
        }
    }

    /// Apply concurrency and deadline settings
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.executor = self.executor.with_timeout(config.item_timeout);
        self.with_concurrency_limit(config.concurrency_limit)
    }

    /// Set concurrency limit (number of items running at once)
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set progress callback
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Host output root
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Run one mini-batch.
    ///
    /// Returns one status per item in submission order. Fails without running
    /// any item when the datasets cannot be mounted, and aborts when a working
    /// area cannot be created. Mounts are released in every case.
    pub async fn run_batch(
        &self,
        mounts: &Arc<ResourceMountManager>,
        items: &[WorkItem],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let batch_id = Uuid::new_v4();
        let span = info_span!("run_batch", %batch_id, item_count = items.len());
        self.run_batch_inner(batch_id, mounts, items, cancel)
            .instrument(span)
            .await
    }

    async fn run_batch_inner(
        &self,
        batch_id: Uuid,
        mounts: &Arc<ResourceMountManager>,
        items: &[WorkItem],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let started_at = Utc::now();
        let batch_start = Instant::now();

        if items.is_empty() {
            info!("No items in mini-batch");
            return Ok(BatchReport {
                batch_id,
                started_at,
                items: Vec::new(),
                release: Default::default(),
                cancelled: cancel.is_cancelled(),
            });
        }

        info!(
            concurrency_limit = self.concurrency_limit,
            output_root = %self.output_root.display(),
            "Starting mini-batch"
        );

        let lease = mounts.lease(&ResourceName::REQUIRED).await.map_err(|e| {
            error!(error = %e, "Could not mount shared datasets, aborting mini-batch");
            MiniBatchError::from(e)
        })?;

        let run_token = cancel.child_token();
        let statuses = self.run_items(items, lease.mounts(), &run_token).await;

        let release = lease.release().await;
        if !release.is_clean() {
            warn!(failures = ?release.failures, "Some datasets failed to unmount");
        }

        let statuses = statuses?;
        let report = BatchReport {
            batch_id,
            started_at,
            items: statuses,
            release,
            cancelled: cancel.is_cancelled(),
        };

        let total = report.items.len();
        let succeeded = report.succeeded();
        let success_rate = (succeeded as f64 / total as f64) * 100.0;
        info!(
            total_items = total,
            succeeded = succeeded,
            failed = report.failed(),
            cancelled = report.cancelled,
            success_rate = format!("{:.2}%", success_rate),
            batch_duration_ms = batch_start.elapsed().as_millis() as u64,
            "Mini-batch completed"
        );
        if success_rate < 80.0 && total > 5 {
            warn!(
                success_rate = format!("{:.2}%", success_rate),
                "High failure rate in mini-batch"
            );
        }

        Ok(report)
    }

    async fn run_items(
        &self,
        items: &[WorkItem],
        mounts: &MountSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<ItemStatus>> {
        let total = items.len();
        let semaphore = Semaphore::new(self.concurrency_limit);
        let completed = AtomicUsize::new(0);

        let lanes = if self.concurrency_limit == 1 {
            vec![(0..total).collect()]
        } else {
            lanes_by_identifier(items)
        };
        debug!(lanes = lanes.len(), "Items grouped into lanes");

        let lane_runs = lanes.into_iter().map(|lane| {
            let semaphore = &semaphore;
            let completed = &completed;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| MiniBatchError::Internal(format!("semaphore closed: {}", e)))?;

                let mut done = Vec::with_capacity(lane.len());
                for index in lane {
                    let item = &items[index];
                    let status = if cancel.is_cancelled() {
                        ItemStatus::not_run(item, FailureReason::Cancelled)
                    } else {
                        match self.run_item(item, mounts, cancel).await {
                            Ok(status) => status,
                            Err(e) => {
                                error!(identifier = %item.identifier, error = %e, "Fatal error, aborting mini-batch");
                                cancel.cancel();
                                return Err(e);
                            }
                        }
                    };

                    let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(callback) = &self.progress_callback {
                        callback(current, total);
                    }
                    done.push((index, status));
                }
                Ok::<_, MiniBatchError>(done)
            }
        });

        let mut slots: Vec<Option<ItemStatus>> = vec![None; total];
        let mut fatal = None;
        for lane in join_all(lane_runs).await {
            match lane {
                Ok(done) => {
                    for (index, status) in done {
                        slots[index] = Some(status);
                    }
                }
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| MiniBatchError::Internal(format!("item {} produced no status", index)))
            })
            .collect()
    }

    async fn run_item(
        &self,
        item: &WorkItem,
        mounts: &MountSet,
        cancel: &CancellationToken,
    ) -> Result<ItemStatus> {
        if item.identifier.is_empty() {
            warn!(source = %item.source.display(), "Input has no file name, skipping");
            return Ok(ItemStatus::not_run(
                item,
                FailureReason::InvalidInput(format!("{} has no file name", item.source.display())),
            ));
        }

        let result = self
            .executor
            .execute(item, mounts, &self.worker_output_root, cancel)
            .await?;

        let mut outcome = match result.failure_reason() {
            None => ItemOutcome::Success,
            Some(reason) => ItemOutcome::Failed(reason),
        };

        let mut output_path = None;
        if result.discovered_output {
            match self.relocate(&result).await {
                Ok(path) => {
                    info!(identifier = %result.identifier, output = %path.display(), "Output relocated");
                    output_path = Some(path);
                }
                Err(e) => {
                    warn!(identifier = %result.identifier, error = %e, "Output relocation failed");
                    if outcome == ItemOutcome::Success {
                        outcome = ItemOutcome::Failed(FailureReason::RelocationFailed(e.to_string()));
                    }
                }
            }
        }

        let label = match &outcome {
            ItemOutcome::Success => "success",
            ItemOutcome::Failed(reason) => reason.label(),
        };
        DriverMetrics::record_item(label, result.duration.as_secs_f64());

        Ok(ItemStatus {
            identifier: result.identifier,
            source: result.source,
            outcome,
            output_path,
            exit_code: result.exit.code(),
            duration_ms: result.duration.as_millis() as u64,
        })
    }

    /// Copy the artifact to `<output root>/<identifier>/`, replacing any earlier copy
    async fn relocate(&self, result: &ExecutionResult) -> std::io::Result<PathBuf> {
        let artifact = &self.executor.pipeline().artifact_filename;
        let output_dir = self.output_root.join(&result.identifier);
        tokio::fs::create_dir_all(&output_dir).await?;

        let destination = output_dir.join(artifact);
        tokio::fs::copy(result.working_area.join(artifact), &destination).await?;
        Ok(destination)
    }
}

/// Group item indices by identifier, lanes ordered by first appearance.
///
/// Items sharing an identifier share a working area and output directory, so
/// they run one after another, in submission order, within one lane.
fn lanes_by_identifier(items: &[WorkItem]) -> Vec<Vec<usize>> {
    let mut lane_of: HashMap<&str, usize> = HashMap::new();
    let mut lanes: Vec<Vec<usize>> = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let lane = *lane_of.entry(item.identifier.as_str()).or_insert_with(|| {
            lanes.push(Vec::new());
            lanes.len() - 1
        });
        lanes[lane].push(index);
    }
    lanes
}
