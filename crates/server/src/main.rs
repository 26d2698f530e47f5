use anyhow::Result;
use clap::Parser;
use dagrun_core::RunnerId;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod logging;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "dagrun")]
#[command(about = "Polling DAG workflow orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dagrun.toml")]
    config: PathBuf,

    /// Data directory for the embedded state store
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Identity used when competing for instance leases; random if unset
    #[arg(long, env = "DAGRUN_RUNNER_ID")]
    runner_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load(&args.config, args.data_dir.clone())?;
    logging::init(&config.logging);

    tracing::info!("Starting dagrun orchestrator");
    if !args.config.exists() {
        tracing::info!("Configuration file not found, using defaults");
    }
    tracing::info!("Data directory: {}", args.data_dir.display());

    let runner_id = args
        .runner_id
        .map(RunnerId::new)
        .unwrap_or_else(RunnerId::generate);
    let state = AppState::new(&config, runner_id)?;

    let cancel = CancellationToken::new();
    let runner = state.runner.clone();
    let runner_cancel = cancel.clone();
    let runner_task = tokio::spawn(async move { runner.run(runner_cancel).await });

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);
    let served = api::serve(&addr, state, cancel.clone()).await;

    // Schedulers release their leases before the process exits
    cancel.cancel();
    if let Err(e) = runner_task.await {
        tracing::error!("Runner loop ended abnormally: {}", e);
    }

    served
}
