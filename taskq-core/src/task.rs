//! Task record, statuses and lifecycle state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::submit::SubmissionError;

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a task, assigned by the store in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Scheduling priority: 0 is the highest, 9 the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(9);
    pub const DEFAULT: Priority = Priority(5);

    /// Validate a raw priority value.
    pub fn new(value: i64) -> Result<Self, SubmissionError> {
        if (Self::HIGHEST.0 as i64..=Self::LOWEST.0 as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(SubmissionError::InvalidPriority(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = SubmissionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value as i64)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, waiting for admission.
    Pending,
    /// Admitted; a child process is alive.
    Running,
    /// Process exited with code 0.
    Completed,
    /// Cancelled while pending or running.
    Cancelled,
    /// Non-zero exit, killed by a signal, timed out or failed to spawn.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
        TaskStatus::Failed,
    ];

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Stable lowercase name, used for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Pending => 1,
            Self::Running => 1 << 1,
            Self::Completed => 1 << 2,
            Self::Cancelled => 1 << 3,
            Self::Failed => 1 << 4,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A typed set of statuses, used to filter store scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSet(u8);

impl StatusSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        TaskStatus::ALL.into_iter().collect()
    }

    pub fn pending() -> Self {
        Self::from(TaskStatus::Pending)
    }

    pub fn running() -> Self {
        Self::from(TaskStatus::Running)
    }

    pub fn terminal() -> Self {
        [TaskStatus::Completed, TaskStatus::Cancelled, TaskStatus::Failed]
            .into_iter()
            .collect()
    }

    pub fn with(self, status: TaskStatus) -> Self {
        Self(self.0 | status.bit())
    }

    pub fn contains(&self, status: TaskStatus) -> bool {
        self.0 & status.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate members in lifecycle order.
    pub fn iter(&self) -> impl Iterator<Item = TaskStatus> + '_ {
        TaskStatus::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl From<TaskStatus> for StatusSet {
    fn from(status: TaskStatus) -> Self {
        Self(status.bit())
    }
}

impl FromIterator<TaskStatus> for StatusSet {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSource {
    /// An explicit cancel request.
    User,
    /// The scheduler force-cancelled in-flight work while stopping.
    Shutdown,
}

impl fmt::Display for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Shutdown => f.write_str("scheduler shutdown"),
        }
    }
}

/// Reason recorded on tasks swept by [`TaskEventKind::Orphaned`].
pub const ORPHANED_REASON: &str = "orphaned: scheduler restarted while task was running";

// ============================================================================
// Task Events
// ============================================================================

/// A timestamped lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// When this event occurred.
    pub ts: DateTime<Utc>,
    /// The event payload.
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    /// Create a new event stamped with the current time, at microsecond
    /// precision.
    pub fn new(kind: TaskEventKind) -> Self {
        Self {
            ts: Utc::now().trunc_subsecs(6),
            kind,
        }
    }

    /// Create a new event with a specific timestamp.
    pub fn with_ts(kind: TaskEventKind, ts: DateTime<Utc>) -> Self {
        Self { ts, kind }
    }
}

/// The kind/payload of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Admitted and spawned.
    /// Transition: Pending → Running
    Started { pid: u32 },

    /// Process exited on its own.
    /// Transition: Running → Completed (exit_code == 0) or Failed
    Exited { exit_code: i32 },

    /// Process was killed by a signal nobody here sent.
    /// Transition: Running → Failed
    Killed { signal: i32 },

    /// Process outlived its timeout and was terminated.
    /// Transition: Running → Failed
    TimedOut { timeout_secs: u64 },

    /// Cancellation took effect.
    /// Transition: Pending|Running → Cancelled
    Cancelled { source: CancelSource },

    /// The command could not be spawned.
    /// Transition: Pending → Failed
    FailedToStart { reason: String },

    /// Found running when a scheduler started; its supervisor is gone.
    /// Transition: Running → Failed
    Orphaned,
}

impl TaskEventKind {
    /// Short name, stored alongside the JSON payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Exited { .. } => "exited",
            Self::Killed { .. } => "killed",
            Self::TimedOut { .. } => "timed_out",
            Self::Cancelled { .. } => "cancelled",
            Self::FailedToStart { .. } => "failed_to_start",
            Self::Orphaned => "orphaned",
        }
    }
}

// ============================================================================
// Transition Errors
// ============================================================================

/// Error when a state transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub event: &'static str,
    pub reason: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition: cannot apply '{}' to task in state '{}': {}",
            self.event, self.from, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}

// ============================================================================
// Task
// ============================================================================

/// A queued shell command and its execution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    // ── Identity ──────────────────────────────────────────────────────────
    pub id: TaskId,
    pub name: String,

    // ── Specification (immutable after submission) ────────────────────────
    /// Shell command string, run through `sh -c`.
    pub command: String,
    pub priority: Priority,
    /// `None` falls back to the scheduler default, `Some(0)` means unlimited.
    pub timeout_secs: Option<u64>,
    /// Environment captured at submission.
    pub env: BTreeMap<String, String>,
    /// Working directory captured at submission.
    pub cwd: PathBuf,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,

    // ── Lifecycle ─────────────────────────────────────────────────────────
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Process ID, present only while running.
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Terminal note: spawn error, timeout, signal, cancellation source.
    pub reason: Option<String>,
}

impl Task {
    /// Apply a lifecycle event, enforcing the state machine.
    pub fn apply(&mut self, event: &TaskEvent) -> Result<(), InvalidTransition> {
        let ts = event.ts;

        match &event.kind {
            TaskEventKind::Started { pid } => {
                self.expect(TaskStatus::Pending, "Started", "task must be Pending to start")?;
                self.status = TaskStatus::Running;
                self.started_at = Some(ts);
                self.pid = Some(*pid);
            }

            TaskEventKind::Exited { exit_code } => {
                self.expect(TaskStatus::Running, "Exited", "task must be Running to exit")?;
                if *exit_code == 0 {
                    self.finish(TaskStatus::Completed, ts, None);
                } else {
                    self.finish(
                        TaskStatus::Failed,
                        ts,
                        Some(format!("exited with code {}", exit_code)),
                    );
                }
                self.exit_code = Some(*exit_code);
            }

            TaskEventKind::Killed { signal } => {
                self.expect(TaskStatus::Running, "Killed", "task must be Running to be killed")?;
                self.finish(
                    TaskStatus::Failed,
                    ts,
                    Some(format!("killed by signal {}", signal)),
                );
            }

            TaskEventKind::TimedOut { timeout_secs } => {
                self.expect(TaskStatus::Running, "TimedOut", "task must be Running to time out")?;
                self.finish(
                    TaskStatus::Failed,
                    ts,
                    Some(format!("timeout exceeded ({}s)", timeout_secs)),
                );
            }

            TaskEventKind::Cancelled { source } => {
                if self.status.is_terminal() {
                    return Err(InvalidTransition {
                        from: self.status,
                        event: "Cancelled",
                        reason: "cannot cancel a task that has already ended".into(),
                    });
                }
                // Skipping Running still leaves a start time behind.
                self.started_at.get_or_insert(ts);
                self.finish(
                    TaskStatus::Cancelled,
                    ts,
                    Some(format!("cancelled by {}", source)),
                );
            }

            TaskEventKind::FailedToStart { reason } => {
                self.expect(
                    TaskStatus::Pending,
                    "FailedToStart",
                    "task must be Pending to fail to start",
                )?;
                self.started_at = Some(ts);
                self.finish(TaskStatus::Failed, ts, Some(reason.clone()));
            }

            TaskEventKind::Orphaned => {
                self.expect(TaskStatus::Running, "Orphaned", "only running tasks can be orphaned")?;
                self.finish(TaskStatus::Failed, ts, Some(ORPHANED_REASON.to_string()));
            }
        }

        Ok(())
    }

    fn expect(
        &self,
        status: TaskStatus,
        event: &'static str,
        reason: &str,
    ) -> Result<(), InvalidTransition> {
        if self.status != status {
            return Err(InvalidTransition {
                from: self.status,
                event,
                reason: reason.into(),
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: TaskStatus, ts: DateTime<Utc>, reason: Option<String>) {
        self.status = status;
        self.ended_at = Some(ts);
        self.pid = None;
        self.reason = reason;
    }

    /// Elapsed run time: end - start, or now - start while running.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or(now) - started)
    }

    /// Resolve the timeout to enforce, given the scheduler default.
    pub fn effective_timeout(
        &self,
        default: Option<std::time::Duration>,
    ) -> Option<std::time::Duration> {
        match self.timeout_secs {
            Some(0) => None,
            Some(secs) => Some(std::time::Duration::from_secs(secs)),
            None => default,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submit::NewTask;

    fn make_task() -> Task {
        NewTask::new("echo hello", "/tmp")
            .name("Test task")
            .into_task(TaskId::new(1), ts("2024-01-15T09:59:00Z"))
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(kind: TaskEventKind, timestamp: DateTime<Utc>) -> TaskEvent {
        TaskEvent::with_ts(kind, timestamp)
    }

    fn started(task: &mut Task) {
        task.apply(&event(
            TaskEventKind::Started { pid: 1234 },
            ts("2024-01-15T10:00:00Z"),
        ))
        .unwrap();
    }

    /// pid is set iff running; start is unset iff pending; end is set iff terminal.
    fn assert_invariants(task: &Task) {
        assert_eq!(task.pid.is_some(), task.status == TaskStatus::Running);
        assert_eq!(task.started_at.is_none(), task.status == TaskStatus::Pending);
        assert_eq!(task.ended_at.is_some(), task.status.is_terminal());
    }

    // ── Lifecycle Transitions ─────────────────────────────────────────────

    #[test]
    fn pending_to_running() {
        let mut task = make_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_invariants(&task);

        started(&mut task);

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.pid, Some(1234));
        assert_eq!(task.started_at, Some(ts("2024-01-15T10:00:00Z")));
        assert_invariants(&task);
    }

    #[test]
    fn running_to_completed_clears_pid() {
        let mut task = make_task();
        started(&mut task);

        task.apply(&event(
            TaskEventKind::Exited { exit_code: 0 },
            ts("2024-01-15T10:01:00Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.exit_code, Some(0));
        assert_eq!(task.pid, None);
        assert_eq!(task.reason, None);
        assert_eq!(task.ended_at, Some(ts("2024-01-15T10:01:00Z")));
        assert_invariants(&task);
    }

    #[test]
    fn running_to_failed_on_nonzero_exit() {
        let mut task = make_task();
        started(&mut task);

        task.apply(&event(
            TaskEventKind::Exited { exit_code: 3 },
            ts("2024-01-15T10:01:00Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.exit_code, Some(3));
        assert_eq!(task.reason.as_deref(), Some("exited with code 3"));
        assert_invariants(&task);
    }

    #[test]
    fn running_to_failed_on_timeout() {
        let mut task = make_task();
        started(&mut task);

        task.apply(&event(
            TaskEventKind::TimedOut { timeout_secs: 2 },
            ts("2024-01-15T10:00:02Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.exit_code, None);
        assert_eq!(task.reason.as_deref(), Some("timeout exceeded (2s)"));
        assert_invariants(&task);
    }

    #[test]
    fn running_to_failed_on_foreign_signal() {
        let mut task = make_task();
        started(&mut task);

        task.apply(&event(
            TaskEventKind::Killed { signal: 9 },
            ts("2024-01-15T10:00:05Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.reason.as_deref(), Some("killed by signal 9"));
    }

    #[test]
    fn pending_to_cancelled_sets_both_timestamps() {
        let mut task = make_task();
        task.apply(&event(
            TaskEventKind::Cancelled {
                source: CancelSource::User,
            },
            ts("2024-01-15T10:00:00Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.started_at, Some(ts("2024-01-15T10:00:00Z")));
        assert_eq!(task.ended_at, Some(ts("2024-01-15T10:00:00Z")));
        assert_eq!(task.duration(Utc::now()), Some(Duration::zero()));
        assert_eq!(task.reason.as_deref(), Some("cancelled by user"));
        assert_invariants(&task);
    }

    #[test]
    fn running_to_cancelled_keeps_start_time() {
        let mut task = make_task();
        started(&mut task);

        task.apply(&event(
            TaskEventKind::Cancelled {
                source: CancelSource::Shutdown,
            },
            ts("2024-01-15T10:00:30Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.started_at, Some(ts("2024-01-15T10:00:00Z")));
        assert_eq!(task.duration(Utc::now()), Some(Duration::seconds(30)));
        assert_eq!(task.reason.as_deref(), Some("cancelled by scheduler shutdown"));
        assert_invariants(&task);
    }

    #[test]
    fn running_to_failed_when_orphaned() {
        let mut task = make_task();
        assert!(task
            .apply(&event(TaskEventKind::Orphaned, ts("2024-01-15T10:00:00Z")))
            .is_err());

        started(&mut task);
        task.apply(&event(TaskEventKind::Orphaned, ts("2024-01-15T11:00:00Z")))
            .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.reason.as_deref(), Some(ORPHANED_REASON));
        assert_invariants(&task);
    }

    #[test]
    fn pending_to_failed_to_start() {
        let mut task = make_task();
        task.apply(&event(
            TaskEventKind::FailedToStart {
                reason: "No such file or directory".to_string(),
            },
            ts("2024-01-15T10:00:00Z"),
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.reason.as_deref(), Some("No such file or directory"));
        assert_invariants(&task);
    }

    // ── Invalid Transitions ───────────────────────────────────────────────

    #[test]
    fn cannot_start_running_task() {
        let mut task = make_task();
        started(&mut task);

        let err = task
            .apply(&event(
                TaskEventKind::Started { pid: 5678 },
                ts("2024-01-15T10:00:01Z"),
            ))
            .unwrap_err();

        assert_eq!(err.from, TaskStatus::Running);
        assert_eq!(err.event, "Started");
        assert_eq!(task.pid, Some(1234));
    }

    #[test]
    fn cannot_complete_pending_task() {
        let mut task = make_task();
        let result = task.apply(&event(
            TaskEventKind::Exited { exit_code: 0 },
            ts("2024-01-15T10:00:00Z"),
        ));

        assert!(result.is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut task = make_task();
        started(&mut task);
        task.apply(&event(
            TaskEventKind::Exited { exit_code: 0 },
            ts("2024-01-15T10:01:00Z"),
        ))
        .unwrap();

        let attempts = [
            TaskEventKind::Started { pid: 1 },
            TaskEventKind::Exited { exit_code: 1 },
            TaskEventKind::TimedOut { timeout_secs: 1 },
            TaskEventKind::Cancelled {
                source: CancelSource::User,
            },
            TaskEventKind::FailedToStart {
                reason: "late".into(),
            },
        ];
        for kind in attempts {
            assert!(task
                .apply(&event(kind, ts("2024-01-15T10:02:00Z")))
                .is_err());
        }
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.ended_at, Some(ts("2024-01-15T10:01:00Z")));
    }

    // ── Derived Values ────────────────────────────────────────────────────

    #[test]
    fn duration_while_running_uses_now() {
        let mut task = make_task();
        assert_eq!(task.duration(Utc::now()), None);

        started(&mut task);
        let now = ts("2024-01-15T10:00:07Z");
        assert_eq!(task.duration(now), Some(Duration::seconds(7)));
    }

    #[test]
    fn effective_timeout_resolution() {
        let default = Some(std::time::Duration::from_secs(60));
        let mut task = make_task();

        task.timeout_secs = None;
        assert_eq!(task.effective_timeout(default), default);
        assert_eq!(task.effective_timeout(None), None);

        task.timeout_secs = Some(0);
        assert_eq!(task.effective_timeout(default), None);

        task.timeout_secs = Some(5);
        assert_eq!(
            task.effective_timeout(default),
            Some(std::time::Duration::from_secs(5))
        );
    }

    // ── Statuses ──────────────────────────────────────────────────────────

    #[test]
    fn status_names_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
        assert_eq!(
            "queued".parse::<TaskStatus>().unwrap_err(),
            UnknownStatus("queued".into())
        );
    }

    #[test]
    fn status_set_membership() {
        let terminal = StatusSet::terminal();
        assert!(terminal.contains(TaskStatus::Completed));
        assert!(terminal.contains(TaskStatus::Cancelled));
        assert!(terminal.contains(TaskStatus::Failed));
        assert!(!terminal.contains(TaskStatus::Pending));
        assert!(!terminal.contains(TaskStatus::Running));

        let active = StatusSet::pending().with(TaskStatus::Running);
        assert_eq!(
            active.iter().collect::<Vec<_>>(),
            vec![TaskStatus::Pending, TaskStatus::Running]
        );
        assert!(StatusSet::empty().is_empty());
        assert_eq!(StatusSet::all().iter().count(), 5);
    }

    #[test]
    fn priority_bounds() {
        assert_eq!(Priority::new(0).unwrap(), Priority::HIGHEST);
        assert_eq!(Priority::new(9).unwrap(), Priority::LOWEST);
        assert_eq!(
            Priority::new(10).unwrap_err(),
            SubmissionError::InvalidPriority(10)
        );
        assert!(Priority::new(-1).is_err());
        assert!(Priority::HIGHEST < Priority::LOWEST);
        assert!(serde_json::from_str::<Priority>("12").is_err());
    }

    #[test]
    fn task_id_parse_and_display() {
        let id: TaskId = " 42 ".parse().unwrap();
        assert_eq!(id, TaskId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<TaskId>().is_err());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = event(
            TaskEventKind::Cancelled {
                source: CancelSource::User,
            },
            ts("2024-01-15T10:00:00Z"),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cancelled");
        assert_eq!(json["source"], "user");

        let parsed: TaskEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }
}
