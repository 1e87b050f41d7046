//! Presentation types shared by the daemon and the CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskq_core::{Task, TaskEvent, TaskId, TaskStatus};

/// Read-only snapshot of a task, as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub command: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Run time so far, or total run time once ended.
    pub duration_ms: Option<i64>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub timeout_secs: Option<u64>,
    pub cwd: PathBuf,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A task together with its lifecycle history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: TaskView,
    pub events: Vec<TaskEvent>,
}

/// Convert a Task to a TaskView, measuring running tasks against `now`.
pub fn task_to_view(task: &Task, now: DateTime<Utc>) -> TaskView {
    TaskView {
        id: task.id,
        name: task.name.clone(),
        command: task.command.clone(),
        priority: task.priority.get(),
        status: task.status,
        created_at: task.created_at,
        started_at: task.started_at,
        ended_at: task.ended_at,
        duration_ms: task.duration(now).map(|d| d.num_milliseconds()),
        pid: task.pid,
        exit_code: task.exit_code,
        reason: task.reason.clone(),
        timeout_secs: task.timeout_secs,
        cwd: task.cwd.clone(),
        stdout_path: task.stdout_path.clone(),
        stderr_path: task.stderr_path.clone(),
        env: task.env.clone(),
    }
}
