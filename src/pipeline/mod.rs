//! External pipeline invocation
//!
//! The pipeline is an opaque script invoked with seven positional arguments:
//!
//! ```text
//! <script> <input> <workdir> <pdb-mount> <uniref-mount> <bfd-mount> <aux-tool> <weights-mount>
//! ```
//!
//! On success it writes a fixed-name artifact into `<workdir>`. Nothing else
//! about its behaviour is interpreted beyond the exit code.

mod process;

pub use process::TokioProcessLauncher;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::resources::{MountSet, ResourceError, ResourceName};
use crate::{MiniBatchError, Result};

/// How the external pipeline is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSpec {
    /// Program that runs the script; `None` executes the script directly
    pub interpreter: Option<PathBuf>,

    /// Pipeline entry script, relative to `source_dir` unless absolute
    pub script: PathBuf,

    /// Checked-out pipeline sources; the child runs with this as its working directory
    pub source_dir: PathBuf,

    /// Auxiliary alignment tool passed in the sixth position
    pub aux_tool_path: PathBuf,

    /// File the pipeline writes into the working area on success
    pub artifact_filename: String,

    /// Deadline for a single pipeline run
    #[serde(with = "crate::config::optional_secs")]
    pub timeout: Option<Duration>,

    /// Scripts under `source_dir` that must carry the executable bit
    pub executable_scripts: Vec<PathBuf>,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            interpreter: Some(PathBuf::from("/bin/sh")),
            script: PathBuf::from("./run_e2e_ver_param.sh"),
            source_dir: PathBuf::from("RoseTTAFold_Remote"),
            aux_tool_path: PathBuf::from("/RoseTTAFold/csblast-2.2.3"),
            artifact_filename: "t000.e2e.pdb".to_string(),
            timeout: None,
            executable_scripts: vec![
                PathBuf::from("run_e2e_ver_param.sh"),
                PathBuf::from("input_prep/make_msa.sh"),
                PathBuf::from("input_prep/make_ss.sh"),
            ],
        }
    }
}

/// One fully resolved pipeline run.
///
/// Field order mirrors the positional contract; [`args`](Self::args) is the
/// only place that order is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineInvocation {
    /// Executable that is spawned
    pub program: PathBuf,
    /// Script handed to the interpreter, if one is used
    pub script: Option<PathBuf>,
    /// Input file
    pub input: PathBuf,
    /// Per-item working directory
    pub working_area: PathBuf,
    /// PDB database mount
    pub pdb_mount: PathBuf,
    /// UniRef database mount
    pub uniref_mount: PathBuf,
    /// BFD database mount
    pub bfd_mount: PathBuf,
    /// Auxiliary alignment tool
    pub aux_tool: PathBuf,
    /// Network weights mount
    pub weights_mount: PathBuf,
    /// Working directory of the child
    pub current_dir: Option<PathBuf>,
}

impl PipelineInvocation {
    /// Build the invocation for one input from the active mounts
    pub fn new(
        spec: &PipelineSpec,
        input: &Path,
        working_area: &Path,
        mounts: &MountSet,
    ) -> std::result::Result<Self, ResourceError> {
        let (program, script) = match &spec.interpreter {
            Some(interpreter) => (interpreter.clone(), Some(spec.script.clone())),
            None => (spec.script.clone(), None),
        };

        Ok(Self {
            program,
            script,
            input: input.to_path_buf(),
            working_area: working_area.to_path_buf(),
            pdb_mount: mounts.path(ResourceName::Pdb)?.to_path_buf(),
            uniref_mount: mounts.path(ResourceName::UniRef)?.to_path_buf(),
            bfd_mount: mounts.path(ResourceName::Bfd)?.to_path_buf(),
            aux_tool: spec.aux_tool_path.clone(),
            weights_mount: mounts.path(ResourceName::Weights)?.to_path_buf(),
            current_dir: (!spec.source_dir.as_os_str().is_empty()).then(|| spec.source_dir.clone()),
        })
    }

    /// Arguments after the program name
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(8);
        if let Some(script) = &self.script {
            args.push(script.clone().into_os_string());
        }
        args.extend(
            [
                &self.input,
                &self.working_area,
                &self.pdb_mount,
                &self.uniref_mount,
                &self.bfd_mount,
                &self.aux_tool,
                &self.weights_mount,
            ]
            .into_iter()
            .map(|path| path.clone().into_os_string()),
        );
        args
    }

    /// Shell-style rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.clone().into_os_string())
            .chain(self.args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ProcessExit {
    /// Exited with a code
    Code(i32),
    /// Terminated by a signal
    Signalled,
    /// Could not be started or waited on
    LaunchFailed(String),
    /// Killed after exceeding its deadline
    TimedOut(Duration),
    /// Killed because the batch was cancelled
    Cancelled,
}

impl ProcessExit {
    /// True for exit code zero
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }

    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Code(code) => Some(*code),
            _ => None,
        }
    }
}

/// Captured result of a pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// How the run ended
    pub exit: ProcessExit,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall time from spawn to exit
    pub duration: Duration,
}

impl ProcessOutcome {
    /// Outcome without captured output
    pub fn bare(exit: ProcessExit, duration: Duration) -> Self {
        Self {
            exit,
            stdout: String::new(),
            stderr: String::new(),
            duration,
        }
    }
}

/// Launches the external pipeline.
///
/// Implementations never fail: launch errors, deadlines and cancellation are
/// all reported through [`ProcessExit`].
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run the invocation to completion, its deadline, or cancellation
    async fn launch(
        &self,
        invocation: &PipelineInvocation,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ProcessOutcome;
}

/// Mark the configured pipeline scripts executable
pub async fn prepare_scripts(spec: &PipelineSpec) -> Result<()> {
    for script in &spec.executable_scripts {
        let path = spec.source_dir.join(script);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            MiniBatchError::PipelineSetup(format!("{}: {}", path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            tokio::fs::set_permissions(&path, permissions)
                .await
                .map_err(|e| MiniBatchError::PipelineSetup(format!("{}: {}", path.display(), e)))?;
        }
        #[cfg(not(unix))]
        let _ = metadata;

        debug!(script = %path.display(), "Pipeline script marked executable");
    }
    Ok(())
}
