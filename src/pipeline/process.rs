use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PipelineInvocation, ProcessExit, ProcessLauncher, ProcessOutcome};

/// Runs the pipeline as a child process with captured stdout and stderr
#[derive(Debug, Clone, Default)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    /// Create a launcher
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(
        &self,
        invocation: &PipelineInvocation,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        let mut command = Command::new(&invocation.program);
        command
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %invocation.program.display(), error = %e, "Pipeline failed to launch");
                return ProcessOutcome::bare(ProcessExit::LaunchFailed(e.to_string()), start.elapsed());
            }
        };
        debug!(pid = ?child.id(), "Pipeline started");

        // Dropping the wait future drops the child, and kill_on_drop kills it.
        // TODO: put the child in its own process group and kill the group, so
        // helpers spawned by the script do not outlive a timeout.
        let output = child.wait_with_output();
        tokio::pin!(output);

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut output => match result {
                Ok(output) => {
                    let exit = match output.status.code() {
                        Some(code) => ProcessExit::Code(code),
                        None => ProcessExit::Signalled,
                    };
                    ProcessOutcome {
                        exit,
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        duration: start.elapsed(),
                    }
                }
                Err(e) => ProcessOutcome::bare(
                    ProcessExit::LaunchFailed(format!("failed to wait on pipeline: {}", e)),
                    start.elapsed(),
                ),
            },
            _ = deadline => {
                let limit = timeout.unwrap_or_default();
                warn!(timeout_secs = limit.as_secs(), "Pipeline exceeded its deadline, killing");
                ProcessOutcome::bare(ProcessExit::TimedOut(limit), start.elapsed())
            }
            _ = cancel.cancelled() => {
                warn!("Batch cancelled, killing pipeline");
                ProcessOutcome::bare(ProcessExit::Cancelled, start.elapsed())
            }
        }
    }
}
