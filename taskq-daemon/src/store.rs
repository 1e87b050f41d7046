//! Durable task store.
//!
//! Thin layer over [`DbService`] that owns validation and the lifecycle
//! state machine: every status change goes through [`Task::apply`] and is
//! persisted with a compare-and-set on the prior status.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use taskq_core::{
    InvalidTransition, NewTask, StatusSet, SubmissionError, Task, TaskEvent, TaskId, TaskStatus,
};

use crate::db::{DbService, TaskOrder};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is {actual}, expected {expected}")]
    Conflict {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("invalid submission: {0}")]
    Submission(#[from] SubmissionError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True when the database itself is unusable, as opposed to a problem
    /// with one task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut
            )
        )
    }

    /// True when SQLite gave up waiting on a lock held by another
    /// connection. The same write can succeed later.
    pub fn is_busy(&self) -> bool {
        let StoreError::Database(sqlx::Error::Database(e)) = self else {
            return false;
        };
        // Extended result codes keep the primary code in the low byte.
        e.code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Task store backed by SQLite.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: DbService,
}

impl TaskStore {
    pub fn new(db: DbService) -> Self {
        Self { db }
    }

    /// Open (creating and migrating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(DbService::open(path).await?))
    }

    /// Open with a custom lock wait instead of the default.
    pub async fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        Ok(Self::new(
            DbService::open_with_busy_timeout(path, busy_timeout).await?,
        ))
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Validate and persist a new pending task.
    pub async fn submit(&self, new: NewTask) -> Result<Task, StoreError> {
        new.validate()?;
        check_filesystem(&new)?;

        let task = self.db.insert_task(new, Utc::now()).await?;
        tracing::info!(
            task = %task.id,
            name = %task.name,
            priority = %task.priority,
            "Task submitted"
        );
        Ok(task)
    }

    /// Get a task by ID.
    pub async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    /// List tasks with a status in `statuses`.
    pub async fn list(
        &self,
        statuses: &StatusSet,
        order: TaskOrder,
        limit: Option<u32>,
    ) -> Result<Vec<Task>, StoreError> {
        Ok(self.db.list_tasks(statuses, order, limit).await?)
    }

    /// Apply `event` to a task whose stored status must be `expected`.
    ///
    /// Fails with [`StoreError::Conflict`] if the stored status differs,
    /// either on read or because another writer changed the row between the
    /// read and the write. Nothing is written in that case.
    pub async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        event: TaskEvent,
    ) -> Result<Task, StoreError> {
        let mut task = self.get(id).await?;
        if task.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: task.status,
            });
        }

        task.apply(&event)?;

        if !self.db.update_task(&task, expected, &event).await? {
            let actual = self.get(id).await?.status;
            return Err(StoreError::Conflict {
                id,
                expected,
                actual,
            });
        }

        tracing::debug!(task = %id, event = event.kind.name(), status = %task.status, "Transition persisted");
        Ok(task)
    }

    /// Lifecycle events for a task, oldest first.
    pub async fn history(&self, id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
        // Distinguish "no events yet" from "no such task".
        self.get(id).await?;
        Ok(self.db.list_events(id).await?)
    }

    /// Fail every task left running by a scheduler that is no longer alive.
    pub async fn mark_orphaned_failed(&self) -> Result<u64, StoreError> {
        Ok(self.db.mark_orphaned_tasks_failed().await?)
    }
}

fn check_filesystem(new: &NewTask) -> Result<(), SubmissionError> {
    match std::fs::metadata(&new.cwd) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(SubmissionError::NotADirectory(new.cwd.clone())),
        Err(_) => return Err(SubmissionError::CwdNotFound(new.cwd.clone())),
    }

    for path in [&new.stdout_path, &new.stderr_path].into_iter().flatten() {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        if !parent.is_dir() {
            return Err(SubmissionError::OutputDirMissing(parent.to_path_buf()));
        }
    }

    Ok(())
}
