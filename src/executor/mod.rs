//! Per-item execution
//!
//! [`ItemExecutor`] runs the pipeline for one [`WorkItem`] inside its own
//! working area (`<worker output root>/<identifier>`) and reports what
//! happened. Launch failures, non-zero exits and timeouts are reported in the
//! [`ExecutionResult`]; only a working area that cannot be created is an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch::{ExecutionResult, WorkItem};
use crate::pipeline::{
    PipelineInvocation, PipelineSpec, ProcessExit, ProcessLauncher, ProcessOutcome,
};
use crate::resources::MountSet;
use crate::{MiniBatchError, Result};

const STDERR_TAIL_LINES: usize = 20;

/// Runs the external pipeline for single items
pub struct ItemExecutor {
    pipeline: PipelineSpec,
    launcher: Arc<dyn ProcessLauncher>,
    timeout: Option<Duration>,
}

impl ItemExecutor {
    /// Create an executor; the pipeline's configured timeout applies
    pub fn new(pipeline: PipelineSpec, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let timeout = pipeline.timeout;
        Self {
            pipeline,
            launcher,
            timeout,
        }
    }

    /// Override the per-run deadline
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pipeline contract this executor invokes
    pub fn pipeline(&self) -> &PipelineSpec {
        &self.pipeline
    }

    /// Working area of an item under a worker output root
    pub fn working_area(item: &WorkItem, worker_output_root: &Path) -> PathBuf {
        worker_output_root.join(&item.identifier)
    }

    /// Run the pipeline for one item
    #[instrument(skip_all, fields(identifier = %item.identifier))]
    pub async fn execute(
        &self,
        item: &WorkItem,
        mounts: &MountSet,
        worker_output_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let working_area = absolute(&Self::working_area(item, worker_output_root));
        if item.identifier.is_empty() {
            let outcome = ProcessOutcome::bare(
                ProcessExit::LaunchFailed(format!("{} has no file name", item.source.display())),
                Duration::ZERO,
            );
            return Ok(ExecutionResult::from_outcome(item, working_area, outcome, false));
        }

        tokio::fs::create_dir_all(&working_area)
            .await
            .map_err(|source| MiniBatchError::WorkingArea {
                path: working_area.clone(),
                source,
            })?;
        debug!(working_area = %working_area.display(), "Working area ready");

        let artifact = working_area.join(&self.pipeline.artifact_filename);
        if let Err(e) = self.remove_stale_artifact(&artifact).await {
            warn!(artifact = %artifact.display(), error = %e, "Could not remove stale artifact, not running");
            let outcome = ProcessOutcome::bare(
                ProcessExit::LaunchFailed(format!(
                    "stale artifact {} could not be removed: {}",
                    artifact.display(),
                    e
                )),
                Duration::ZERO,
            );
            return Ok(ExecutionResult::from_outcome(item, working_area, outcome, false));
        }

        let invocation = PipelineInvocation::new(
            &self.pipeline,
            &absolute(&item.source),
            &working_area,
            mounts,
        )?;
        info!(command = %invocation.command_line(), "Running pipeline");

        let outcome = self.launcher.launch(&invocation, self.timeout, cancel).await;
        let discovered_output = tokio::fs::try_exists(&artifact).await.unwrap_or(false);

        let result = ExecutionResult::from_outcome(item, working_area, outcome, discovered_output);
        self.log_result(&result);
        Ok(result)
    }

    /// An artifact left by an earlier run must be gone before launch, or
    /// discovery would report it as this run's output.
    async fn remove_stale_artifact(&self, artifact: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_file(artifact).await {
            Ok(()) => {
                debug!(artifact = %artifact.display(), "Removed artifact from an earlier run");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn log_result(&self, result: &ExecutionResult) {
        debug!(stdout = %result.stdout, stderr = %result.stderr, "Pipeline output");

        if result.succeeded() {
            info!(
                duration_ms = result.duration.as_millis() as u64,
                "Pipeline produced {}", self.pipeline.artifact_filename
            );
        } else {
            warn!(
                exit = ?result.exit,
                discovered_output = result.discovered_output,
                duration_ms = result.duration.as_millis() as u64,
                stderr_tail = %tail(&result.stderr, STDERR_TAIL_LINES),
                "Pipeline run failed"
            );
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
