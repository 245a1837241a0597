//! Work items, per-item results and the batch report

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::{ProcessExit, ProcessOutcome};
use crate::resources::ReleaseReport;

/// One input file of a mini-batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Path as supplied by the host
    pub source: PathBuf,
    /// Basename cut at its first `.`; names the working area and output directory
    pub identifier: String,
}

impl WorkItem {
    /// Create an item and derive its identifier.
    ///
    /// The basename is truncated at the *first* dot, so `sample.v2.pdb`
    /// becomes `sample`. A basename starting with a dot keeps its full name,
    /// and a path without a basename gets an empty identifier.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let identifier = Self::derive_identifier(&source);
        Self { source, identifier }
    }

    fn derive_identifier(source: &Path) -> String {
        let Some(name) = source.file_name() else {
            return String::new();
        };
        let name = name.to_string_lossy();
        match name.split('.').next() {
            Some(stem) if !stem.is_empty() => stem.to_string(),
            _ => name.into_owned(),
        }
    }

    /// Full basename of the source path, extension included
    pub fn file_name(&self) -> Option<String> {
        self.source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Result of running the pipeline for one item
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Item identifier
    pub identifier: String,
    /// Input path as supplied
    pub source: PathBuf,
    /// Directory the pipeline ran in
    pub working_area: PathBuf,
    /// How the run ended
    pub exit: ProcessExit,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Whether the artifact was found in the working area after the run
    pub discovered_output: bool,
    /// Wall time of the run
    pub duration: Duration,
}

impl ExecutionResult {
    pub(crate) fn from_outcome(
        item: &WorkItem,
        working_area: PathBuf,
        outcome: ProcessOutcome,
        discovered_output: bool,
    ) -> Self {
        Self {
            identifier: item.identifier.clone(),
            source: item.source.clone(),
            working_area,
            exit: outcome.exit,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            discovered_output,
            duration: outcome.duration,
        }
    }

    /// Clean exit and artifact present
    pub fn succeeded(&self) -> bool {
        self.exit.is_success() && self.discovered_output
    }

    /// Why the item failed, or `None` when it succeeded
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.exit {
            ProcessExit::Code(0) if self.discovered_output => None,
            ProcessExit::Code(0) => Some(FailureReason::OutputNotFound),
            ProcessExit::Code(code) => Some(FailureReason::NonZeroExit(Some(*code))),
            ProcessExit::Signalled => Some(FailureReason::NonZeroExit(None)),
            ProcessExit::LaunchFailed(message) => Some(FailureReason::LaunchFailed(message.clone())),
            ProcessExit::TimedOut(limit) => Some(FailureReason::TimedOut {
                seconds: limit.as_secs(),
            }),
            ProcessExit::Cancelled => Some(FailureReason::Cancelled),
        }
    }
}

/// Why an item failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// Non-zero exit code, or `None` when killed by a signal
    NonZeroExit(Option<i32>),
    /// Pipeline could not be started
    LaunchFailed(String),
    /// Pipeline exceeded its deadline
    TimedOut {
        /// Configured deadline
        seconds: u64,
    },
    /// Pipeline exited cleanly but the artifact is missing
    OutputNotFound,
    /// Artifact could not be copied to the output root
    RelocationFailed(String),
    /// Input path has no usable basename
    InvalidInput(String),
    /// Batch was cancelled before or during the item
    Cancelled,
}

impl FailureReason {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::NonZeroExit(_) => "non_zero_exit",
            FailureReason::LaunchFailed(_) => "launch_failed",
            FailureReason::TimedOut { .. } => "timed_out",
            FailureReason::OutputNotFound => "output_not_found",
            FailureReason::RelocationFailed(_) => "relocation_failed",
            FailureReason::InvalidInput(_) => "invalid_input",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// Per-item outcome reported to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ItemOutcome {
    /// Artifact produced and relocated
    Success,
    /// Item failed for the given reason
    Failed(FailureReason),
}

/// Status of one submitted item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStatus {
    /// Item identifier
    pub identifier: String,
    /// Input path as supplied
    pub source: PathBuf,
    /// Success or failure reason
    pub outcome: ItemOutcome,
    /// Relocated artifact, when the pipeline produced one
    pub output_path: Option<PathBuf>,
    /// Exit code, when the pipeline exited normally
    pub exit_code: Option<i32>,
    /// Wall time of the run in milliseconds
    pub duration_ms: u64,
}

impl ItemStatus {
    /// Status for an item that never ran
    pub fn not_run(item: &WorkItem, reason: FailureReason) -> Self {
        Self {
            identifier: item.identifier.clone(),
            source: item.source.clone(),
            outcome: ItemOutcome::Failed(reason),
            output_path: None,
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Legacy status string, `"<identifier>: <source path>"`.
    ///
    /// The prefix is the identifier (`a: a.pdb`), not the full basename the
    /// legacy driver printed (`a.pdb: a.pdb`); this difference is intentional.
    /// The line is the same for successes and failures; use
    /// [`ItemStatus::outcome`] to tell them apart.
    pub fn status_line(&self) -> String {
        format!("{}: {}", self.identifier, self.source.display())
    }

    /// True when the item succeeded
    pub fn is_success(&self) -> bool {
        self.outcome == ItemOutcome::Success
    }
}

/// Everything the host gets back from one mini-batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Unique id of this mini-batch run
    pub batch_id: Uuid,
    /// When the batch started
    pub started_at: DateTime<Utc>,
    /// One entry per submitted item, in submission order
    pub items: Vec<ItemStatus>,
    /// Outcome of the end-of-batch unmount
    pub release: ReleaseReport,
    /// Whether the host cancelled the batch
    pub cancelled: bool,
}

impl BatchReport {
    /// Legacy status strings, in submission order
    pub fn status_lines(&self) -> Vec<String> {
        self.items.iter().map(ItemStatus::status_line).collect()
    }

    /// Number of successful items
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|s| s.is_success()).count()
    }

    /// Number of failed items
    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Batch execution configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items executed at the same time; 1 runs the batch sequentially
    pub concurrency_limit: usize,
    /// Deadline for a single pipeline run
    pub item_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            item_timeout: None,
        }
    }
}
