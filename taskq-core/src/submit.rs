//! Submission requests.
//!
//! [`NewTask::validate`] performs the checks that need no IO. Filesystem
//! checks (cwd exists, output directories exist) are done by the store before
//! the row is written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{Priority, Task, TaskId, TaskStatus};

/// Largest accepted timeout, in seconds (100 years).
pub const MAX_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("{field} must not contain NUL bytes")]
    InteriorNul { field: &'static str },

    #[error("priority {0} is out of range (0-9)")]
    InvalidPriority(i64),

    #[error("timeout {0}s is out of range (max {max}s)", max = MAX_TIMEOUT_SECS)]
    InvalidTimeout(u64),

    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvKey(String),

    #[error("{field} must be an absolute path: {path}")]
    RelativePath { field: &'static str, path: PathBuf },

    #[error("name must not be empty")]
    EmptyName,

    #[error("working directory does not exist: {0}")]
    CwdNotFound(PathBuf),

    #[error("working directory is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("output directory does not exist: {0}")]
    OutputDirMissing(PathBuf),
}

/// A task as submitted, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub command: String,
    pub priority: Priority,
    pub timeout_secs: Option<u64>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl NewTask {
    /// Start a submission. The name defaults to the command's first word.
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        let command = command.into();
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            command,
            priority: Priority::DEFAULT,
            timeout_secs: None,
            env: BTreeMap::new(),
            cwd: cwd.into(),
            stdout_path: None,
            stderr_path: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_path = Some(path.into());
        self
    }

    /// Checks that need no filesystem access.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.command.trim().is_empty() {
            return Err(SubmissionError::EmptyCommand);
        }
        if self.command.contains('\0') {
            return Err(SubmissionError::InteriorNul { field: "command" });
        }
        if self.name.trim().is_empty() {
            return Err(SubmissionError::EmptyName);
        }
        if let Some(secs) = self.timeout_secs.filter(|&secs| secs > MAX_TIMEOUT_SECS) {
            return Err(SubmissionError::InvalidTimeout(secs));
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') {
                return Err(SubmissionError::InvalidEnvKey(key.clone()));
            }
            if key.contains('\0') || value.contains('\0') {
                return Err(SubmissionError::InteriorNul { field: "env" });
            }
        }

        absolute("cwd", &self.cwd)?;
        if let Some(path) = &self.stdout_path {
            absolute("stdout", path)?;
        }
        if let Some(path) = &self.stderr_path {
            absolute("stderr", path)?;
        }
        Ok(())
    }

    /// Build the pending task record once an id has been assigned.
    pub fn into_task(self, id: TaskId, created_at: DateTime<Utc>) -> Task {
        Task {
            id,
            name: self.name,
            command: self.command,
            priority: self.priority,
            timeout_secs: self.timeout_secs,
            env: self.env,
            cwd: self.cwd,
            stdout_path: self.stdout_path,
            stderr_path: self.stderr_path,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            ended_at: None,
            pid: None,
            exit_code: None,
            reason: None,
        }
    }
}

fn absolute(field: &'static str, path: &Path) -> Result<(), SubmissionError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(SubmissionError::RelativePath {
            field,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_defaults_to_first_word() {
        let new = NewTask::new("  sleep 10 && echo done", "/tmp");
        assert_eq!(new.name, "sleep");
        assert_eq!(new.priority, Priority::DEFAULT);
        assert!(new.validate().is_ok());
    }

    #[test]
    fn rejects_empty_command() {
        let new = NewTask::new("   ", "/tmp");
        assert_eq!(new.validate(), Err(SubmissionError::EmptyCommand));
    }

    #[test]
    fn rejects_nul_bytes() {
        let new = NewTask::new("echo a\0b", "/tmp");
        assert_eq!(
            new.validate(),
            Err(SubmissionError::InteriorNul { field: "command" })
        );

        let new = NewTask::new("true", "/tmp").env([("A".to_string(), "x\0".to_string())]);
        assert_eq!(
            new.validate(),
            Err(SubmissionError::InteriorNul { field: "env" })
        );
    }

    #[test]
    fn rejects_bad_env_keys() {
        for key in ["", "A=B"] {
            let new = NewTask::new("true", "/tmp").env([(key.to_string(), "x".to_string())]);
            assert_eq!(
                new.validate(),
                Err(SubmissionError::InvalidEnvKey(key.to_string()))
            );
        }
    }

    #[test]
    fn timeout_is_bounded() {
        let new = NewTask::new("true", "/tmp").timeout_secs(MAX_TIMEOUT_SECS);
        assert!(new.validate().is_ok());

        let new = NewTask::new("true", "/tmp").timeout_secs(i64::MAX as u64);
        assert_eq!(
            new.validate(),
            Err(SubmissionError::InvalidTimeout(i64::MAX as u64))
        );
    }

    #[test]
    fn rejects_relative_paths() {
        let new = NewTask::new("true", "relative/dir");
        assert!(matches!(
            new.validate(),
            Err(SubmissionError::RelativePath { field: "cwd", .. })
        ));

        let new = NewTask::new("true", "/tmp").stdout("out.log");
        assert!(matches!(
            new.validate(),
            Err(SubmissionError::RelativePath { field: "stdout", .. })
        ));
    }

    #[test]
    fn into_task_is_pending() {
        let created = Utc::now();
        let task = NewTask::new("make build", "/src")
            .name("build")
            .priority(Priority::HIGHEST)
            .timeout_secs(30)
            .stderr("/tmp/build.err")
            .into_task(TaskId::new(7), created);

        assert_eq!(task.id, TaskId::new(7));
        assert_eq!(task.name, "build");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.created_at, created);
        assert_eq!(task.timeout_secs, Some(30));
        assert_eq!(task.stderr_path, Some(PathBuf::from("/tmp/build.err")));
        assert!(task.started_at.is_none());
        assert!(task.pid.is_none());
    }
}
