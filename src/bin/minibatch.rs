//! Run one mini-batch from the command line and print its report as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use minibatch::config::ConfigLoader;
use minibatch::logging::init_tracing;
use minibatch::pipeline::TokioProcessLauncher;
use minibatch::resources::LocalDirectoryRegistry;
use minibatch::worker::WorkerContext;

#[derive(Parser, Debug)]
#[command(name = "minibatch", version, about = "Run the structure-prediction pipeline over a mini-batch of inputs")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Input files, processed in the given order
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .load(cli.config.as_ref())
        .context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json_logs;
    init_tracing(&config.logging);

    let registry = Arc::new(LocalDirectoryRegistry::new(config.datasets.clone()));
    let worker = WorkerContext::init(config, registry, Arc::new(TokioProcessLauncher::new()))
        .await
        .context("worker init failed")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling mini-batch");
            ctrl_c.cancel();
        }
    });

    let result = worker.run_batch_with_cancel(cli.inputs, &cancel).await;
    let leftover = worker.shutdown().await;
    if !leftover.is_clean() {
        error!(failures = ?leftover.failures, "Datasets failed to unmount at shutdown");
    }

    let report = result.context("mini-batch aborted")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
