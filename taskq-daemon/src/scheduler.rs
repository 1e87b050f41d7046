//! The scheduler loop.
//!
//! A single tokio task owns the process registry and is the only writer of
//! lifecycle transitions while it runs. It wakes on three sources:
//!
//! - the poll ticker: admit pending tasks up to the concurrency limit
//! - exit reports from process watchers: persist the terminal status, then
//!   admit again
//! - commands from [`SchedulerHandle`]s: cancel, stop, status
//!
//! Commands are processed between those steps, so a cancel never observes a
//! task halfway through admission.
//!
//! Lifecycle writes that hit a locked database are kept in order and retried
//! on every tick. Admission waits until they are all written.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskq_core::{
    CancelSource, StatusSet, Task, TaskEvent, TaskEventKind, TaskId, TaskStatus,
};
use taskq_proc::ExitStatus;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{DrainPolicy, SchedulerConfig};
use crate::control::ControlError;
use crate::db::TaskOrder;
use crate::store::{StoreError, TaskStore};
use crate::supervisor::{Claim, ProcessExit, ProcessRegistry, ProcessSupervisor};

/// Attempts at cancelling a pending task before giving up on conflicts.
const CANCEL_ATTEMPTS: usize = 3;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// How long to wait for killed children when the loop fails.
const ABORT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {0} is running but not supervised by this scheduler")]
    NotSupervised(TaskId),

    #[error("scheduler is not running")]
    Unavailable,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The cancellation took effect (pending) or was initiated (running).
    Ack,
    /// Nothing to do: the task already ended or is already terminating.
    Noop,
}

/// A task currently owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub pid: u32,
    pub elapsed_ms: u64,
    /// A timeout or cancellation has been claimed.
    pub terminating: bool,
}

/// Point-in-time view of a live scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub running: Vec<RunningTask>,
    /// Set once a stop has been requested.
    pub stopping: Option<DrainPolicy>,
}

#[derive(Debug)]
enum Command {
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<CancelOutcome, SchedulerError>>,
    },
    Stop {
        drain: DrainPolicy,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<SchedulerStatus>,
    },
}

/// Cloneable handle for talking to a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Cancel a task. Pending tasks are cancelled before this returns;
    /// running tasks are signalled and reach `cancelled` once reaped.
    pub async fn request_cancel(&self, id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply }).await?;
        rx.await.map_err(|_| SchedulerError::Unavailable)?
    }

    /// Stop admitting work. The loop exits once no process remains.
    pub async fn stop(&self, drain: DrainPolicy) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { drain, reply }).await?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SchedulerError::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    Started,
    FailedToStart,
}

/// A lifecycle event not yet written to the store.
#[derive(Debug, Clone)]
struct PendingWrite {
    id: TaskId,
    expected: TaskStatus,
    event: TaskEvent,
}

/// Scheduler/executor engine.
pub struct Scheduler {
    store: TaskStore,
    config: SchedulerConfig,
    supervisor: ProcessSupervisor,
    registry: ProcessRegistry,
    exits_rx: mpsc::Receiver<ProcessExit>,
    commands_rx: mpsc::Receiver<Command>,
    backlog: VecDeque<PendingWrite>,
    stopping: Option<DrainPolicy>,
    started_at: DateTime<Utc>,
}

impl Scheduler {
    /// Spawn the scheduler loop on the current runtime.
    pub fn start(
        store: TaskStore,
        config: SchedulerConfig,
    ) -> (SchedulerHandle, JoinHandle<Result<(), SchedulerError>>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (supervisor, exits_rx) =
            ProcessSupervisor::new(config.grace_period, config.exit_poll_interval);

        let scheduler = Scheduler {
            store,
            config,
            supervisor,
            registry: ProcessRegistry::new(),
            exits_rx,
            commands_rx,
            backlog: VecDeque::new(),
            stopping: None,
            started_at: Utc::now(),
        };

        let join = tokio::spawn(scheduler.run());
        (
            SchedulerHandle {
                commands: commands_tx,
            },
            join,
        )
    }

    async fn run(mut self) -> Result<(), SchedulerError> {
        tracing::info!(
            concurrency = self.config.concurrency,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            default_timeout_secs = ?self.config.default_timeout.map(|t| t.as_secs()),
            grace_secs = self.config.grace_period.as_secs(),
            "Scheduler started"
        );

        let result = self.run_loop().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Store failure, stopping scheduler");
            self.abort_all().await;
        }

        tracing::info!("Scheduler stopped");
        result.map_err(SchedulerError::from)
    }

    async fn run_loop(&mut self) -> Result<(), StoreError> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            let idle = self.registry.is_empty() && self.backlog.is_empty();
            if self.stopping.is_some() && idle {
                return Ok(());
            }

            let ticking = self.stopping.is_none() || !self.backlog.is_empty();
            tokio::select! {
                _ = ticker.tick(), if ticking => {
                    self.flush().await?;
                    self.admit().await?;
                }
                Some(exit) = self.exits_rx.recv() => {
                    self.on_exit(exit).await?;
                }
                command = self.commands_rx.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        tracing::debug!("All scheduler handles dropped");
                        commands_open = false;
                    }
                },
                else => return Ok(()),
            }
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    async fn admit(&mut self) -> Result<(), StoreError> {
        loop {
            if self.stopping.is_some() || !self.backlog.is_empty() {
                return Ok(());
            }
            let free = self.config.concurrency.saturating_sub(self.registry.len());
            if free == 0 {
                return Ok(());
            }

            let batch = match self
                .store
                .list(&StatusSet::pending(), TaskOrder::Queue, Some(free as u32))
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll pending tasks");
                    return Ok(());
                }
            };

            let fetched = batch.len();
            let mut failed = 0;
            for task in batch {
                if !self.backlog.is_empty() {
                    return Ok(());
                }
                if self.launch(task).await? == Launch::FailedToStart {
                    failed += 1;
                }
            }

            // Refill slots freed by spawn failures.
            if failed == 0 || fetched < free {
                return Ok(());
            }
        }
    }

    async fn launch(&mut self, task: Task) -> Result<Launch, StoreError> {
        let id = task.id;
        let timeout = task.effective_timeout(self.config.default_timeout);

        match self.supervisor.start(&mut self.registry, &task, timeout) {
            Ok(pid) => {
                let event = TaskEvent::new(TaskEventKind::Started { pid });
                self.record(id, TaskStatus::Pending, event).await?;
                Ok(Launch::Started)
            }
            Err(spawn_err) => {
                tracing::warn!(task = %id, error = %spawn_err, "Failed to start task");
                let event = TaskEvent::new(TaskEventKind::FailedToStart {
                    reason: spawn_err.to_string(),
                });
                self.record(id, TaskStatus::Pending, event).await?;
                Ok(Launch::FailedToStart)
            }
        }
    }

    // =========================================================================
    // Completion
    // =========================================================================

    async fn on_exit(&mut self, exit: ProcessExit) -> Result<(), StoreError> {
        if self.registry.get(exit.task_id).is_none() {
            tracing::debug!(task = %exit.task_id, "Exit report for untracked task");
            return Ok(());
        }

        let kind = match exit.claim {
            Claim::Aborted => None,
            Claim::TimedOut => Some(TaskEventKind::TimedOut {
                timeout_secs: exit.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
            Claim::Cancelled(source) => Some(TaskEventKind::Cancelled { source }),
            Claim::Exited => Some(match exit.status {
                ExitStatus::Code(exit_code) => TaskEventKind::Exited { exit_code },
                ExitStatus::Signaled(signal) => TaskEventKind::Killed { signal },
            }),
        };

        match kind {
            None => {
                self.registry.remove(exit.task_id);
                tracing::debug!(task = %exit.task_id, pid = exit.pid, "Aborted process reaped");
            }
            // The handle stays registered until the exit is written, so the
            // slot is not reused while the row still says running.
            Some(kind) => {
                self.record(exit.task_id, TaskStatus::Running, TaskEvent::new(kind))
                    .await?;
            }
        }

        self.admit().await
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Queue a lifecycle write behind any earlier ones and flush.
    async fn record(
        &mut self,
        id: TaskId,
        expected: TaskStatus,
        event: TaskEvent,
    ) -> Result<(), StoreError> {
        self.backlog.push_back(PendingWrite {
            id,
            expected,
            event,
        });
        self.flush().await
    }

    /// Write queued events oldest first. Stops at the first busy error and
    /// leaves the rest for the next tick.
    async fn flush(&mut self) -> Result<(), StoreError> {
        while let Some(write) = self.backlog.front().cloned() {
            match self
                .store
                .transition(write.id, write.expected, write.event.clone())
                .await
            {
                Ok(task) => {
                    self.backlog.pop_front();
                    self.written(&task, &write.event);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_busy() => {
                    tracing::warn!(
                        task = %write.id,
                        event = write.event.kind.name(),
                        queued = self.backlog.len(),
                        error = %e,
                        "Database busy, will retry"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.backlog.pop_front();
                    self.rejected(&write, &e);
                }
            }
        }
        Ok(())
    }

    fn written(&mut self, task: &Task, event: &TaskEvent) {
        match &event.kind {
            TaskEventKind::Started { pid } => {
                tracing::info!(task = %task.id, name = %task.name, pid, "Task started");
            }
            TaskEventKind::FailedToStart { .. } => {}
            _ => {
                let elapsed = self.registry.remove(task.id).map(|h| h.elapsed());
                tracing::info!(
                    task = %task.id,
                    status = %task.status,
                    exit_code = ?task.exit_code,
                    reason = ?task.reason,
                    elapsed_ms = ?elapsed.map(|e| e.as_millis() as u64),
                    "Task finished"
                );
            }
        }
    }

    fn rejected(&mut self, write: &PendingWrite, error: &StoreError) {
        let id = write.id;
        match &write.event.kind {
            TaskEventKind::Started { pid } => {
                tracing::warn!(task = %id, pid, %error, "Task changed before it was marked running, killing process");
                if let Some(handle) = self.registry.get(id) {
                    handle.kill();
                }
            }
            TaskEventKind::FailedToStart { .. } => {
                tracing::warn!(task = %id, %error, "Failed to record start failure");
            }
            _ => {
                tracing::warn!(task = %id, %error, "Failed to record task exit");
                self.registry.remove(id);
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Cancel { id, reply } => {
                let result = self.on_cancel(id).await;
                let _ = reply.send(result);
            }
            Command::Stop { drain, reply } => {
                self.on_stop(drain);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_cancel(&mut self, id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        if let Some(handle) = self.registry.get(id) {
            return Ok(if handle.terminate(Claim::Cancelled(CancelSource::User)) {
                tracing::info!(task = %id, pid = handle.pid(), "Cancelling running task");
                CancelOutcome::Ack
            } else {
                tracing::debug!(task = %id, claim = ?handle.claim(), "Task already terminating");
                CancelOutcome::Noop
            });
        }

        cancel_unsupervised(&self.store, id).await
    }

    fn on_stop(&mut self, drain: DrainPolicy) {
        // A cancel drain is never downgraded.
        let drain = match self.stopping {
            Some(DrainPolicy::Cancel) => DrainPolicy::Cancel,
            _ => drain,
        };
        if self.stopping != Some(drain) {
            tracing::info!(?drain, running = self.registry.len(), "Stopping scheduler");
        }
        self.stopping = Some(drain);

        if drain == DrainPolicy::Cancel {
            for (id, handle) in self.registry.iter() {
                if handle.terminate(Claim::Cancelled(CancelSource::Shutdown)) {
                    tracing::info!(task = %id, pid = handle.pid(), "Cancelling task for shutdown");
                }
            }
        }
    }

    fn snapshot(&self) -> SchedulerStatus {
        let mut running: Vec<RunningTask> = self
            .registry
            .iter()
            .map(|(task_id, handle)| RunningTask {
                task_id,
                pid: handle.pid(),
                elapsed_ms: handle.elapsed().as_millis() as u64,
                terminating: handle.claim().is_some(),
            })
            .collect();
        running.sort_by_key(|r| r.task_id);

        SchedulerStatus {
            pid: std::process::id(),
            started_at: self.started_at,
            concurrency: self.config.concurrency,
            poll_interval_ms: self.config.poll_interval.as_millis() as u64,
            running,
            stopping: self.stopping,
        }
    }

    /// SIGKILL every child and wait briefly for the watchers to reap them.
    async fn abort_all(&mut self) {
        // Exits still waiting to be written were already reaped.
        for write in self.backlog.drain(..) {
            if write.expected == TaskStatus::Running {
                self.registry.remove(write.id);
            }
        }
        for (_, handle) in self.registry.iter() {
            handle.kill();
        }
        while !self.registry.is_empty() {
            match tokio::time::timeout(ABORT_WAIT, self.exits_rx.recv()).await {
                Ok(Some(exit)) => {
                    self.registry.remove(exit.task_id);
                }
                _ => {
                    tracing::warn!(
                        remaining = self.registry.len(),
                        "Gave up waiting for killed processes"
                    );
                    break;
                }
            }
        }
    }
}

/// Cancel a task that no live process belongs to.
///
/// Pending tasks are cancelled with a compare-and-set, retried on conflict.
/// Terminal tasks are a no-op.
pub(crate) async fn cancel_unsupervised(
    store: &TaskStore,
    id: TaskId,
) -> Result<CancelOutcome, SchedulerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let task = store.get(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => SchedulerError::NotFound(id),
            e => SchedulerError::Store(e),
        })?;

        match task.status {
            TaskStatus::Pending => {
                let event = TaskEvent::new(TaskEventKind::Cancelled {
                    source: CancelSource::User,
                });
                match store.transition(id, TaskStatus::Pending, event).await {
                    Ok(_) => {
                        tracing::info!(task = %id, "Cancelled pending task");
                        return Ok(CancelOutcome::Ack);
                    }
                    Err(StoreError::Conflict { .. }) if attempt < CANCEL_ATTEMPTS => {
                        tracing::debug!(task = %id, attempt, "Cancel raced with another update, retrying");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            TaskStatus::Running => return Err(SchedulerError::NotSupervised(id)),
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed => {
                tracing::debug!(task = %id, status = %task.status, "Cancel of finished task ignored");
                return Ok(CancelOutcome::Noop);
            }
        }
    }
}
