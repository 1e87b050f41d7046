//! Scheduler process lifecycle: startup recovery, control socket, shutdown.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::{ConfigError, DataPaths, DrainPolicy, SchedulerConfig};
use crate::control::{ControlError, ControlServer};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{StoreError, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("scheduler task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Run a scheduler over the data directory until it stops.
///
/// Each value received on `shutdown` is forwarded as a stop request; a
/// later `Cancel` escalates an earlier `Wait`.
pub async fn run(
    paths: &DataPaths,
    config: SchedulerConfig,
    mut shutdown: mpsc::Receiver<DrainPolicy>,
) -> Result<(), ServeError> {
    config.validate()?;
    paths.ensure()?;

    tracing::info!(path = %paths.db_path().display(), "Opening database");
    let store = TaskStore::open(paths.db_path()).await?;

    // Bind before the sweep: a live socket means another scheduler owns
    // the running rows.
    let control = ControlServer::bind(paths.socket_path()).await?;

    let orphaned = store.mark_orphaned_failed().await?;
    if orphaned > 0 {
        tracing::warn!(
            count = orphaned,
            "Marked tasks left running by a previous scheduler as failed"
        );
    }

    let (scheduler, mut join) = Scheduler::start(store.clone(), config);
    let control_task = tokio::spawn(control.serve(scheduler.clone()));

    let mut shutdown_open = true;
    let joined = loop {
        tokio::select! {
            joined = &mut join => break joined,
            drain = shutdown.recv(), if shutdown_open => match drain {
                Some(drain) => {
                    if let Err(e) = scheduler.stop(drain).await {
                        tracing::warn!(error = %e, "Failed to deliver stop request");
                    }
                }
                None => shutdown_open = false,
            },
        }
    };

    control_task.abort();
    if let Err(e) = std::fs::remove_file(paths.socket_path()) {
        tracing::debug!(error = %e, "Failed to remove control socket");
    }
    store.close().await;

    joined??;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run until SIGINT or SIGTERM.
///
/// The first signal stops with the configured drain policy, any further
/// signal cancels running tasks.
pub async fn serve(paths: DataPaths, config: SchedulerConfig) -> Result<(), ServeError> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(4);
    let mut drain = config.drain;

    let signal_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!(?drain, "Received SIGINT (Ctrl+C), initiating shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!(?drain, "Received SIGTERM, initiating shutdown");
                }
            }
            if tx.send(drain).await.is_err() {
                break;
            }
            drain = DrainPolicy::Cancel;
        }
    });

    let result = run(&paths, config, rx).await;
    signal_task.abort();
    result
}
