//! Test harness for scheduler end-to-end tests.
//!
//! Each [`TestQueue`] owns a temporary directory holding the database, the
//! task working directory and any output files.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use taskq_core::{NewTask, Priority, Task, TaskId, TaskStatus};
use taskq_daemon::{
    DataPaths, DrainPolicy, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, TaskStore,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// How long any single wait in these tests may take.
pub const WAIT_LIMIT: Duration = Duration::from_secs(20);

pub struct TestQueue {
    pub dir: TempDir,
    pub paths: DataPaths,
    pub store: TaskStore,
}

#[allow(dead_code)]
impl TestQueue {
    pub async fn new() -> Self {
        Self::with_busy_timeout(Duration::from_secs(5)).await
    }

    /// A queue whose store gives up on a locked database after `busy_timeout`.
    pub async fn with_busy_timeout(busy_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let paths = DataPaths::new(dir.path().join("data"));
        paths.ensure().expect("Failed to create data dir");
        let store = TaskStore::open_with_busy_timeout(paths.db_path(), busy_timeout)
            .await
            .expect("Failed to open store");
        Self { dir, paths, store }
    }

    /// Hold the database write lock on a separate connection, as another
    /// process writing to the queue would.
    pub async fn lock_database(&self) -> SqliteConnection {
        let options = SqliteConnectOptions::new().filename(self.paths.db_path());
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .expect("Failed to open second connection");
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut conn)
            .await
            .expect("Failed to take write lock");
        conn
    }

    /// Fast-polling config suitable for tests.
    pub fn config(concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            concurrency,
            poll_interval: Duration::from_millis(50),
            default_timeout: None,
            grace_period: Duration::from_secs(1),
            drain: DrainPolicy::Wait,
            exit_poll_interval: Duration::from_millis(20),
        }
    }

    pub fn start(
        &self,
        config: SchedulerConfig,
    ) -> (SchedulerHandle, JoinHandle<Result<(), SchedulerError>>) {
        Scheduler::start(self.store.clone(), config)
    }

    /// A task running in the temp dir with this process's environment.
    pub fn task(&self, command: &str) -> NewTask {
        NewTask::new(command, self.dir.path()).env(std::env::vars())
    }

    pub async fn submit(&self, new: NewTask) -> TaskId {
        self.store.submit(new).await.expect("Failed to submit").id
    }

    pub async fn submit_cmd(&self, command: &str) -> TaskId {
        self.submit(self.task(command)).await
    }

    pub async fn submit_many(&self, n: usize, command: &str) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(self.submit_cmd(command).await);
        }
        ids
    }

    pub async fn submit_prio(&self, command: &str, priority: i64) -> TaskId {
        let priority = Priority::new(priority).expect("Invalid priority");
        self.submit(self.task(command).priority(priority)).await
    }

    pub async fn get(&self, id: TaskId) -> Task {
        self.store.get(id).await.expect("Failed to load task")
    }

    /// Poll until the task reaches `status`.
    pub async fn wait_for_status(&self, id: TaskId, status: TaskStatus) -> Task {
        self.wait_until(id, |task| task.status == status).await
    }

    /// Poll until the task is terminal.
    pub async fn wait_terminal(&self, id: TaskId) -> Task {
        self.wait_until(id, |task| task.status.is_terminal()).await
    }

    pub async fn wait_until(&self, id: TaskId, done: impl Fn(&Task) -> bool) -> Task {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let task = self.get(id).await;
            if done(&task) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("task {id} stuck in {} after {WAIT_LIMIT:?}", task.status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Wait for the scheduler loop to return.
#[allow(dead_code)]
pub async fn join_scheduler(join: JoinHandle<Result<(), SchedulerError>>) {
    tokio::time::timeout(WAIT_LIMIT, join)
        .await
        .expect("Scheduler did not stop in time")
        .expect("Scheduler task panicked")
        .expect("Scheduler returned an error");
}

/// Release a lock taken with [`TestQueue::lock_database`].
#[allow(dead_code)]
pub async fn unlock_database(mut conn: SqliteConnection) {
    sqlx::query("COMMIT")
        .execute(&mut conn)
        .await
        .expect("Failed to release write lock");
}
