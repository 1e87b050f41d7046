//! Database service for persistent task storage.
//!
//! Wraps SQLite access via sqlx. Timestamps are stored as fixed-width
//! RFC 3339 text (microsecond precision, `Z` suffix) so that lexical order
//! matches chronological order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskq_core::{
    NewTask, Priority, StatusSet, Task, TaskEvent, TaskEventKind, TaskId, TaskStatus,
    ORPHANED_REASON,
};

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "id, name, command, priority, status, created_at, started_at, \
     ended_at, pid, timeout_secs, env, cwd, stdout_path, stderr_path, exit_code, reason";

/// Ordering for task scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOrder {
    /// Admission order: priority, then submission time, then id.
    #[default]
    Queue,
    /// Most recently submitted first.
    Recent,
}

impl TaskOrder {
    fn sql(self) -> &'static str {
        match self {
            TaskOrder::Queue => " ORDER BY priority ASC, created_at ASC, id ASC",
            TaskOrder::Recent => " ORDER BY created_at DESC, id DESC",
        }
    }
}

/// Database service wrapping SQLite access.
#[derive(Clone)]
pub struct DbService {
    pool: SqlitePool,
}

impl std::fmt::Debug for DbService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbService").finish_non_exhaustive()
    }
}

impl DbService {
    /// Open or create a database at the given path.
    ///
    /// Runs migrations automatically to ensure schema is up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        Self::open_with_busy_timeout(path, BUSY_TIMEOUT).await
    }

    /// Like [`DbService::open`], waiting at most `busy_timeout` for locks.
    pub async fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Configuration(format!("Failed to create db directory: {}", e).into())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            // WAL lets the CLI read while the scheduler writes
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite performs best with single writer
            .connect_with(options)
            .await?;

        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert a new pending task, returning it with its assigned id.
    pub async fn insert_task(
        &self,
        new: NewTask,
        created_at: DateTime<Utc>,
    ) -> Result<Task, sqlx::Error> {
        let created_at = created_at.trunc_subsecs(6);
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                name, command, priority, status, created_at,
                timeout_secs, env, cwd, stdout_path, stderr_path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&new.name)
        .bind(&new.command)
        .bind(new.priority.get() as i64)
        .bind(TaskStatus::Pending.as_str())
        .bind(fmt_ts(&created_at))
        .bind(new.timeout_secs.map(|t| t as i64))
        .bind(encode_json(&new.env)?)
        .bind(path_text(&new.cwd))
        .bind(new.stdout_path.as_deref().map(path_text))
        .bind(new.stderr_path.as_deref().map(path_text))
        .execute(&self.pool)
        .await?;

        Ok(new.into_task(TaskId::new(result.last_insert_rowid()), created_at))
    }

    /// Load a single task.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>, sqlx::Error> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(parse_task_row).transpose()
    }

    /// Load tasks whose status is in `statuses`, in the requested order.
    pub async fn list_tasks(
        &self,
        statuses: &StatusSet,
        order: TaskOrder,
        limit: Option<u32>,
    ) -> Result<Vec<Task>, sqlx::Error> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ("));
        let mut separated = qb.separated(", ");
        for status in statuses.iter() {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
        qb.push(order.sql());
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(parse_task_row).collect()
    }

    /// Persist a transition computed by [`Task::apply`].
    ///
    /// The row is only written if its stored status still equals `expected`;
    /// the event is appended in the same transaction. Returns `false` (and
    /// writes nothing) when the row no longer matches.
    pub async fn update_task(
        &self,
        task: &Task,
        expected: TaskStatus,
        event: &TaskEvent,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?2,
                started_at = ?3,
                ended_at = ?4,
                pid = ?5,
                exit_code = ?6,
                reason = ?7
            WHERE id = ?1 AND status = ?8
            "#,
        )
        .bind(task.id.as_i64())
        .bind(task.status.as_str())
        .bind(task.started_at.as_ref().map(fmt_ts))
        .bind(task.ended_at.as_ref().map(fmt_ts))
        .bind(task.pid.map(|p| p as i64))
        .bind(task.exit_code)
        .bind(&task.reason)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, ts, kind, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(task.id.as_i64())
        .bind(fmt_ts(&event.ts))
        .bind(event.kind.name())
        .bind(encode_json(&event.kind)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Lifecycle events recorded for a task, oldest first.
    pub async fn list_events(&self, id: TaskId) -> Result<Vec<TaskEvent>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT ts, payload FROM task_events
            WHERE task_id = ?1
            ORDER BY id
            "#,
        )
        .bind(id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let ts = parse_ts("ts", row.try_get("ts")?)?;
            let payload: String = row.try_get("payload")?;
            let kind: TaskEventKind = serde_json::from_str(&payload)
                .map_err(|e| sqlx::Error::Decode(format!("Invalid event JSON: {}", e).into()))?;
            events.push(TaskEvent::with_ts(kind, ts));
        }

        Ok(events)
    }

    /// Mark all tasks with status "running" as failed.
    ///
    /// Called on scheduler startup to handle tasks that were running when the
    /// previous scheduler died.
    pub async fn mark_orphaned_tasks_failed(&self) -> Result<u64, sqlx::Error> {
        let now = fmt_ts(&Utc::now());
        let kind = TaskEventKind::Orphaned;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO task_events (task_id, ts, kind, payload)
            SELECT id, ?1, ?2, ?3 FROM tasks WHERE status = 'running'
            "#,
        )
        .bind(&now)
        .bind(kind.name())
        .bind(encode_json(&kind)?)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                pid = NULL,
                ended_at = ?1,
                reason = ?2
            WHERE status = 'running'
            "#,
        )
        .bind(&now)
        .bind(ORPHANED_REASON)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, value: String) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(format!("Invalid {}: {}", column, e).into()))
}

fn parse_opt_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    row.try_get::<Option<String>, _>(column)?
        .map(|s| parse_ts(column, s))
        .transpose()
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

/// Parse a database row into a Task.
fn parse_task_row(row: &SqliteRow) -> Result<Task, sqlx::Error> {
    let id = TaskId::new(row.try_get("id")?);
    let name: String = row.try_get("name")?;
    let command: String = row.try_get("command")?;

    let priority_raw: i64 = row.try_get("priority")?;
    let priority = Priority::new(priority_raw)
        .map_err(|e| sqlx::Error::Decode(format!("Invalid priority: {}", e).into()))?;

    let status_str: String = row.try_get("status")?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e| sqlx::Error::Decode(format!("Invalid status: {}", e).into()))?;

    let created_at = parse_ts("created_at", row.try_get("created_at")?)?;
    let started_at = parse_opt_ts(row, "started_at")?;
    let ended_at = parse_opt_ts(row, "ended_at")?;

    let pid: Option<u32> = row.try_get::<Option<i64>, _>("pid")?.map(|p| p as u32);
    let timeout_secs: Option<u64> = row
        .try_get::<Option<i64>, _>("timeout_secs")?
        .map(|t| t as u64);

    let env_json: String = row.try_get("env")?;
    let env: BTreeMap<String, String> = serde_json::from_str(&env_json)
        .map_err(|e| sqlx::Error::Decode(format!("Invalid env JSON: {}", e).into()))?;

    let cwd = PathBuf::from(row.try_get::<String, _>("cwd")?);
    let stdout_path = row
        .try_get::<Option<String>, _>("stdout_path")?
        .map(PathBuf::from);
    let stderr_path = row
        .try_get::<Option<String>, _>("stderr_path")?
        .map(PathBuf::from);

    let exit_code: Option<i32> = row.try_get("exit_code")?;
    let reason: Option<String> = row.try_get("reason")?;

    Ok(Task {
        id,
        name,
        command,
        priority,
        timeout_secs,
        env,
        cwd,
        stdout_path,
        stderr_path,
        status,
        created_at,
        started_at,
        ended_at,
        pid,
        exit_code,
        reason,
    })
}
