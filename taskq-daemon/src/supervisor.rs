//! Process supervisor - spawns task processes and watches them to completion.
//!
//! Each running task gets one watcher task that is the only reaper of its
//! child. The watcher polls for exit, enforces the timeout, escalates
//! SIGTERM to SIGKILL after the grace period, and reports a [`ProcessExit`]
//! to the scheduler. It never touches the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskq_core::{CancelSource, Task, TaskId};
use taskq_proc::{
    signal_pgid, spawn_shell, try_wait, Child, ExitStatus, ProcError, Signal, SpawnSpec,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Exit reports buffered between watchers and the scheduler loop.
const EXIT_CHANNEL_CAPACITY: usize = 64;

/// How a supervised process came to an end.
///
/// Decided exactly once per process through a [`TerminationClaim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The process exited before anyone asked it to stop.
    Exited,
    /// The timeout elapsed.
    TimedOut,
    /// A cancellation was requested.
    Cancelled(CancelSource),
    /// Killed without a status change (the row was taken by another writer,
    /// or the scheduler is failing).
    Aborted,
}

impl Claim {
    fn encode(self) -> u8 {
        match self {
            Claim::Exited => 1,
            Claim::TimedOut => 2,
            Claim::Cancelled(CancelSource::User) => 3,
            Claim::Cancelled(CancelSource::Shutdown) => 4,
            Claim::Aborted => 5,
        }
    }

    fn decode(value: u8) -> Option<Self> {
        match value {
            1 => Some(Claim::Exited),
            2 => Some(Claim::TimedOut),
            3 => Some(Claim::Cancelled(CancelSource::User)),
            4 => Some(Claim::Cancelled(CancelSource::Shutdown)),
            5 => Some(Claim::Aborted),
            _ => None,
        }
    }
}

/// First-wins termination decision shared by a watcher and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct TerminationClaim(Arc<AtomicU8>);

impl TerminationClaim {
    /// Record `claim` if nothing has been claimed yet.
    pub fn try_claim(&self, claim: Claim) -> bool {
        self.0
            .compare_exchange(0, claim.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get(&self) -> Option<Claim> {
        Claim::decode(self.0.load(Ordering::Acquire))
    }
}

/// Outcome of a supervised process, sent once it has been reaped.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub task_id: TaskId,
    pub pid: u32,
    pub status: ExitStatus,
    pub claim: Claim,
    /// The timeout that was enforced, if any.
    pub timeout: Option<Duration>,
    pub elapsed: Duration,
}

/// The scheduler's view of one live process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    pgid: taskq_proc::ProcessGroupId,
    started: Instant,
    claim: TerminationClaim,
    wake: Arc<Notify>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The termination claimed so far, if any.
    pub fn claim(&self) -> Option<Claim> {
        self.claim.get()
    }

    /// Ask the watcher to terminate the process.
    ///
    /// Returns `false` if another termination (or a natural exit) was
    /// claimed first; no signal is sent in that case.
    pub fn terminate(&self, claim: Claim) -> bool {
        if self.claim.try_claim(claim) {
            self.wake.notify_one();
            true
        } else {
            false
        }
    }

    /// SIGKILL the process group right away, whatever was claimed.
    pub fn kill(&self) {
        if !self.terminate(Claim::Aborted) {
            send_signal(self.pgid, Signal::Kill);
        }
    }
}

/// Running processes, keyed by task. Owned by one scheduler.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: HashMap<TaskId, ProcessHandle>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, id: TaskId) -> Option<&ProcessHandle> {
        self.handles.get(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<ProcessHandle> {
        self.handles.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &ProcessHandle)> {
        self.handles.iter().map(|(id, handle)| (*id, handle))
    }
}

/// Spawns task processes and hands each to a watcher.
#[derive(Debug)]
pub struct ProcessSupervisor {
    grace: Duration,
    exit_poll: Duration,
    exits_tx: mpsc::Sender<ProcessExit>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiving end of its exit reports.
    pub fn new(grace: Duration, exit_poll: Duration) -> (Self, mpsc::Receiver<ProcessExit>) {
        let (exits_tx, exits_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
        (
            Self {
                grace,
                exit_poll,
                exits_tx,
            },
            exits_rx,
        )
    }

    /// Spawn `task` and start watching it. Returns the child's pid.
    pub fn start(
        &self,
        registry: &mut ProcessRegistry,
        task: &Task,
        timeout: Option<Duration>,
    ) -> Result<u32, ProcError> {
        let mut spec = SpawnSpec::new(task.command.clone())?
            .cwd(&task.cwd)
            .env(task.env.clone());
        if let Some(path) = &task.stdout_path {
            spec = spec.stdout(path);
        }
        if let Some(path) = &task.stderr_path {
            spec = spec.stderr(path);
        }

        let child = spawn_shell(spec)?;
        let pid = child.pid.as_raw() as u32;
        let claim = TerminationClaim::default();
        let wake = Arc::new(Notify::new());

        tracing::info!(
            task = %task.id,
            pid,
            timeout_secs = ?timeout.map(|t| t.as_secs()),
            "Spawned process"
        );

        let watcher = Watcher {
            task_id: task.id,
            child,
            timeout,
            grace: self.grace,
            exit_poll: self.exit_poll,
            claim: claim.clone(),
            wake: wake.clone(),
            exits_tx: self.exits_tx.clone(),
        };
        tokio::spawn(watcher.run());

        registry.handles.insert(
            task.id,
            ProcessHandle {
                pid,
                pgid: child.pgid,
                started: Instant::now(),
                claim,
                wake,
            },
        );

        Ok(pid)
    }
}

#[derive(Debug, Clone, Copy)]
enum Escalation {
    None,
    Terminated { kill_at: Instant },
    Killed,
}

struct Watcher {
    task_id: TaskId,
    child: Child,
    timeout: Option<Duration>,
    grace: Duration,
    exit_poll: Duration,
    claim: TerminationClaim,
    wake: Arc<Notify>,
    exits_tx: mpsc::Sender<ProcessExit>,
}

impl Watcher {
    async fn run(self) {
        let started = Instant::now();
        // Unrepresentable deadlines are treated as no deadline.
        let deadline = self.timeout.and_then(|t| started.checked_add(t));
        let mut escalation = Escalation::None;

        let status = loop {
            match try_wait(self.child.pid) {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(task = %self.task_id, pid = %self.child.pid, error = %e, "waitpid failed");
                    break ExitStatus::Code(-1);
                }
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline && self.claim.try_claim(Claim::TimedOut) {
                    tracing::warn!(
                        task = %self.task_id,
                        timeout_secs = ?self.timeout.map(|t| t.as_secs()),
                        "Timeout exceeded, terminating"
                    );
                }
            }

            escalation = self.escalate(escalation, now);

            tokio::select! {
                _ = tokio::time::sleep(self.exit_poll) => {}
                _ = self.wake.notified() => {}
            }
        };

        // Nobody claimed first: the exit was natural.
        self.claim.try_claim(Claim::Exited);
        let claim = self.claim.get().unwrap_or(Claim::Exited);
        if claim != Claim::Exited {
            // Sweep anything the shell left behind in its group.
            send_signal(self.child.pgid, Signal::Kill);
        }

        tracing::debug!(task = %self.task_id, pid = %self.child.pid, ?status, ?claim, "Process reaped");

        let exit = ProcessExit {
            task_id: self.task_id,
            pid: self.child.pid.as_raw() as u32,
            status,
            claim,
            timeout: self.timeout,
            elapsed: started.elapsed(),
        };
        if self.exits_tx.send(exit).await.is_err() {
            tracing::debug!(task = %self.task_id, "Scheduler gone, exit report dropped");
        }
    }

    fn escalate(&self, current: Escalation, now: Instant) -> Escalation {
        match (current, self.claim.get()) {
            (Escalation::None, Some(Claim::Aborted)) => {
                send_signal(self.child.pgid, Signal::Kill);
                Escalation::Killed
            }
            (Escalation::None, Some(Claim::TimedOut | Claim::Cancelled(_))) => {
                send_signal(self.child.pgid, Signal::Term);
                Escalation::Terminated {
                    kill_at: now.checked_add(self.grace).unwrap_or(now),
                }
            }
            (Escalation::Terminated { kill_at }, _) if now >= kill_at => {
                tracing::warn!(task = %self.task_id, pid = %self.child.pid, "Grace period elapsed, sending SIGKILL");
                send_signal(self.child.pgid, Signal::Kill);
                Escalation::Killed
            }
            (current, _) => current,
        }
    }
}

fn send_signal(pgid: taskq_proc::ProcessGroupId, sig: Signal) {
    match signal_pgid(pgid, sig) {
        Ok(()) => tracing::debug!(pgid = pgid.as_raw(), ?sig, "Signalled process group"),
        Err(e) if e.is_gone() => {}
        Err(e) => tracing::warn!(pgid = pgid.as_raw(), ?sig, error = %e, "Failed to signal process group"),
    }
}
