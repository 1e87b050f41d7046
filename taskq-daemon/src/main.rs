//! taskqd - scheduler for the taskq task queue
//!
//! Admits pending tasks from the store, runs them as shell commands and
//! records how they end. Stops on SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use taskq_daemon::{server, DataPaths, SchedulerArgs};
use tracing_subscriber::EnvFilter;

/// taskq scheduler daemon
#[derive(Parser)]
#[command(name = "taskqd", version, about)]
struct Cli {
    /// Data directory holding the database and control socket [env: TASKQ_HOME]
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    scheduler: SchedulerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli
        .scheduler
        .resolve()
        .context("Invalid scheduler configuration")?;
    let paths = DataPaths::resolve(cli.data_dir)?;

    server::serve(paths, config)
        .await
        .context("Scheduler exited with error")
}
