//! Client-facing task operations.
//!
//! [`TaskService`] is what the CLI talks to. Reads and submissions go
//! straight to the store, which is safe while a scheduler runs. Anything
//! that touches a live process goes through the scheduler's control socket.

use std::path::PathBuf;

use chrono::Utc;
use taskq_core::{NewTask, StatusSet, TaskId};

use crate::config::{DataPaths, DrainPolicy};
use crate::control::ControlClient;
use crate::convert::{task_to_view, TaskDetail, TaskView};
use crate::db::TaskOrder;
use crate::scheduler::{cancel_unsupervised, CancelOutcome, SchedulerError, SchedulerStatus};
use crate::store::{StoreError, TaskStore};

#[derive(Debug, Clone)]
pub struct TaskService {
    store: TaskStore,
    socket_path: PathBuf,
}

impl TaskService {
    pub fn new(store: TaskStore, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            socket_path: socket_path.into(),
        }
    }

    /// Open the store under `paths`. The directory must already exist.
    pub async fn open(paths: &DataPaths) -> Result<Self, SchedulerError> {
        let store = TaskStore::open(paths.db_path()).await?;
        Ok(Self::new(store, paths.socket_path()))
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    /// Validate and enqueue a task. It is picked up on the scheduler's next
    /// poll.
    pub async fn submit(&self, new: NewTask) -> Result<TaskView, StoreError> {
        let task = self.store.submit(new).await?;
        Ok(task_to_view(&task, Utc::now()))
    }

    pub async fn get_status(&self, id: TaskId) -> Result<TaskView, StoreError> {
        let task = self.store.get(id).await?;
        Ok(task_to_view(&task, Utc::now()))
    }

    /// Task snapshot plus its lifecycle history.
    pub async fn describe(&self, id: TaskId) -> Result<TaskDetail, StoreError> {
        let task = self.store.get(id).await?;
        let events = self.store.history(id).await?;
        Ok(TaskDetail {
            task: task_to_view(&task, Utc::now()),
            events,
        })
    }

    pub async fn list(
        &self,
        statuses: &StatusSet,
        order: TaskOrder,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>, StoreError> {
        let now = Utc::now();
        Ok(self
            .store
            .list(statuses, order, limit)
            .await?
            .iter()
            .map(|task| task_to_view(task, now))
            .collect())
    }

    /// Cancel a task.
    ///
    /// With a scheduler running the request is forwarded to it. Without one,
    /// pending tasks are cancelled directly in the store; running tasks
    /// cannot be, since nothing here owns their process.
    pub async fn request_cancel(&self, id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        match ControlClient::connect(&self.socket_path).await {
            Ok(mut client) => client.cancel(id).await,
            Err(SchedulerError::Unavailable) => {
                tracing::debug!(task = %id, "No scheduler running, cancelling in store");
                cancel_unsupervised(&self.store, id)
                    .await
                    .map_err(|e| match e {
                        SchedulerError::NotSupervised(_) => SchedulerError::Unavailable,
                        e => e,
                    })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn scheduler_status(&self) -> Result<SchedulerStatus, SchedulerError> {
        ControlClient::connect(&self.socket_path)
            .await?
            .status()
            .await
    }

    pub async fn stop_scheduler(&self, drain: DrainPolicy) -> Result<(), SchedulerError> {
        ControlClient::connect(&self.socket_path)
            .await?
            .stop(drain)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskq_core::{TaskEvent, TaskEventKind, TaskStatus};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_offline_cancel() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data"));
        paths.ensure().unwrap();
        let service = TaskService::open(&paths).await.unwrap();

        let pending = service
            .submit(NewTask::new("sleep 1", dir.path()))
            .await
            .unwrap();
        assert_eq!(
            service.request_cancel(pending.id).await.unwrap(),
            CancelOutcome::Ack
        );
        let view = service.get_status(pending.id).await.unwrap();
        assert_eq!(view.status, TaskStatus::Cancelled);
        assert_eq!(view.reason.as_deref(), Some("cancelled by user"));

        // Already terminal.
        assert_eq!(
            service.request_cancel(pending.id).await.unwrap(),
            CancelOutcome::Noop
        );

        // Running without a scheduler to signal it.
        let running = service
            .submit(NewTask::new("sleep 1", dir.path()))
            .await
            .unwrap();
        service
            .store()
            .transition(
                running.id,
                TaskStatus::Pending,
                TaskEvent::new(TaskEventKind::Started { pid: 4242 }),
            )
            .await
            .unwrap();
        assert!(matches!(
            service.request_cancel(running.id).await.unwrap_err(),
            SchedulerError::Unavailable
        ));

        assert!(matches!(
            service.request_cancel(TaskId::new(999)).await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_describe_includes_history() {
        let dir = tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data"));
        paths.ensure().unwrap();
        let service = TaskService::open(&paths).await.unwrap();

        let view = service
            .submit(NewTask::new("echo hi", dir.path()))
            .await
            .unwrap();
        service.request_cancel(view.id).await.unwrap();

        let detail = service.describe(view.id).await.unwrap();
        assert_eq!(detail.task.status, TaskStatus::Cancelled);
        assert_eq!(detail.events.len(), 1);
        assert_eq!(detail.events[0].kind.name(), "cancelled");
    }
}
