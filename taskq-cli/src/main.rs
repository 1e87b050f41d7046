//! taskq CLI - submit, inspect and control queued shell tasks

mod utils;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use taskq_core::{NewTask, Priority, StatusSet, TaskId, TaskStatus};
use taskq_daemon::{
    server, CancelOutcome, DataPaths, DrainPolicy, SchedulerArgs, SchedulerError, TaskOrder,
    TaskService, TaskStore, TaskView,
};
use tracing_subscriber::EnvFilter;

use crate::utils::{format_duration_ms, format_timestamp, truncate};

/// taskq - durable shell task queue
#[derive(Parser)]
#[command(name = "taskq", version, about)]
struct Cli {
    /// Data directory holding the database and control socket [env: TASKQ_HOME]
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and database
    Init,

    /// Queue a shell command
    Submit {
        /// Task name (defaults to the first word of the command)
        #[arg(long)]
        name: Option<String>,

        /// Priority, 0 (highest) to 9 (lowest)
        #[arg(short, long, default_value_t = 5)]
        priority: i64,

        /// Kill the task after this many seconds; 0 disables the scheduler default
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Working directory (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Append stdout to this file
        #[arg(long)]
        stdout: Option<PathBuf>,

        /// Append stderr to this file
        #[arg(long)]
        stderr: Option<PathBuf>,

        /// Extra environment variables (KEY=VALUE), on top of the current environment
        #[arg(long = "env", value_name = "KEY=VALUE")]
        envs: Vec<String>,

        /// Command to run with /bin/sh -c
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// List tasks
    Ls {
        /// Only show tasks with this status (repeatable)
        #[arg(long, value_enum)]
        status: Vec<StatusFilter>,

        /// Sort order
        #[arg(long, value_enum, default_value_t = OrderArg::Queue)]
        order: OrderArg,

        /// Show at most N tasks
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show task details and lifecycle history
    Show {
        /// Task ID
        task_id: TaskId,
    },

    /// Cancel a pending or running task
    Cancel {
        /// Task ID
        task_id: TaskId,
    },

    /// Run the scheduler in the foreground
    Start {
        #[command(flatten)]
        scheduler: SchedulerArgs,
    },

    /// Ask the running scheduler to stop
    Stop {
        /// What to do with running tasks
        #[arg(long, value_enum, default_value_t = DrainPolicy::Wait)]
        drain: DrainPolicy,
    },

    /// Show whether a scheduler is running
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for TaskStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => TaskStatus::Pending,
            StatusFilter::Running => TaskStatus::Running,
            StatusFilter::Completed => TaskStatus::Completed,
            StatusFilter::Failed => TaskStatus::Failed,
            StatusFilter::Cancelled => TaskStatus::Cancelled,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    /// Dispatch order: priority, then submission time
    Queue,
    /// Newest first
    Recent,
}

impl From<OrderArg> for TaskOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Queue => TaskOrder::Queue,
            OrderArg::Recent => TaskOrder::Recent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_filter = match cli.command {
        Commands::Start { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let result = run(cli).await;

    if let Err(e) = &result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let paths = DataPaths::resolve(cli.data_dir)?;
    let json = cli.json;

    match cli.command {
        Commands::Init => cmd_init(&paths).await,

        Commands::Start { scheduler } => {
            let config = scheduler
                .resolve()
                .context("Invalid scheduler configuration")?;
            server::serve(paths, config)
                .await
                .context("Scheduler exited with error")
        }

        Commands::Submit {
            name,
            priority,
            timeout,
            cwd,
            stdout,
            stderr,
            envs,
            command,
        } => {
            let mut new = NewTask::new(command.join(" "), absolute(cwd.unwrap_or_default())?)
                .priority(Priority::new(priority)?)
                .env(std::env::vars().chain(parse_envs(&envs)?));
            if let Some(name) = name {
                new = new.name(name);
            }
            if let Some(secs) = timeout {
                new = new.timeout_secs(secs);
            }
            if let Some(path) = stdout {
                new = new.stdout(absolute(path)?);
            }
            if let Some(path) = stderr {
                new = new.stderr(absolute(path)?);
            }
            cmd_submit(&open_service(&paths).await?, new, json).await
        }

        Commands::Ls {
            status,
            order,
            limit,
        } => {
            let statuses = if status.is_empty() {
                StatusSet::all()
            } else {
                status.into_iter().map(TaskStatus::from).collect()
            };
            let service = open_service(&paths).await?;
            cmd_ls(&service, &statuses, order.into(), limit, json).await
        }

        Commands::Show { task_id } => cmd_show(&open_service(&paths).await?, task_id, json).await,

        Commands::Cancel { task_id } => {
            cmd_cancel(&open_service(&paths).await?, task_id, json).await
        }

        Commands::Stop { drain } => cmd_stop(&open_service(&paths).await?, drain).await,

        Commands::Status => cmd_status(&open_service(&paths).await?, json).await,
    }
}

async fn open_service(paths: &DataPaths) -> Result<TaskService> {
    paths.ensure()?;
    TaskService::open(paths)
        .await
        .with_context(|| format!("Failed to open task store in {}", paths.root().display()))
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_init(paths: &DataPaths) -> Result<()> {
    paths.ensure()?;
    let store = TaskStore::open(paths.db_path())
        .await
        .context("Failed to create database")?;
    store.close().await;

    println!("{}", paths.root().display());
    eprintln!("Initialized taskq data directory");
    Ok(())
}

async fn cmd_submit(service: &TaskService, new: NewTask, json: bool) -> Result<()> {
    let task = service.submit(new).await.context("Submit failed")?;

    if json {
        println!("{}", serde_json::to_string(&task)?);
    } else {
        // Task id to stdout (script-friendly), human info to stderr.
        println!("{}", task.id);
        eprintln!("Queued task: {} (priority {})", task.name, task.priority);
    }
    Ok(())
}

async fn cmd_ls(
    service: &TaskService,
    statuses: &StatusSet,
    order: TaskOrder,
    limit: Option<u32>,
    json: bool,
) -> Result<()> {
    let tasks = service
        .list(statuses, order, limit)
        .await
        .context("List failed")?;

    if json {
        println!("{}", serde_json::to_string(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        eprintln!("No tasks found");
        return Ok(());
    }

    println!(
        "{:<6}  {:<3}  {:<10}  {:<12}  {:<9}  {}",
        "ID", "PRI", "STATUS", "NAME", "DURATION", "CMD"
    );
    println!("{}", "-".repeat(80));
    for task in &tasks {
        println!(
            "{:<6}  {:<3}  {:<10}  {:<12}  {:<9}  {}",
            task.id,
            task.priority,
            task.status,
            truncate(&task.name, 12),
            task.duration_ms.map(format_duration_ms).unwrap_or_default(),
            truncate(&task.command, 30)
        );
    }
    Ok(())
}

async fn cmd_show(service: &TaskService, id: TaskId, json: bool) -> Result<()> {
    let detail = service.describe(id).await.context("Show failed")?;

    if json {
        println!("{}", serde_json::to_string(&detail)?);
        return Ok(());
    }

    print_task(&detail.task);

    if !detail.events.is_empty() {
        println!();
        println!("History:");
        for event in &detail.events {
            println!(
                "  {}  {}",
                format_timestamp(event.ts),
                serde_json::to_string(&event.kind)?
            );
        }
    }
    Ok(())
}

fn print_task(task: &TaskView) {
    println!("Task: {}", task.id);
    println!("Name: {}", task.name);
    println!("Command: {}", task.command);
    println!("CWD: {}", task.cwd.display());
    println!("Priority: {}", task.priority);
    println!("Status: {}", task.status);

    if let Some(secs) = task.timeout_secs {
        println!("Timeout: {}s", secs);
    }
    if let Some(pid) = task.pid {
        println!("PID: {}", pid);
    }
    if let Some(code) = task.exit_code {
        println!("Exit Code: {}", code);
    }
    if let Some(ref reason) = task.reason {
        println!("Reason: {}", reason);
    }
    if let Some(ref path) = task.stdout_path {
        println!("Stdout: {}", path.display());
    }
    if let Some(ref path) = task.stderr_path {
        println!("Stderr: {}", path.display());
    }

    println!("Created: {}", format_timestamp(task.created_at));
    if let Some(ts) = task.started_at {
        println!("Started: {}", format_timestamp(ts));
    }
    if let Some(ts) = task.ended_at {
        println!("Ended: {}", format_timestamp(ts));
    }
    if let Some(ms) = task.duration_ms {
        println!("Duration: {}", format_duration_ms(ms));
    }
}

async fn cmd_cancel(service: &TaskService, id: TaskId, json: bool) -> Result<()> {
    let outcome = match service.request_cancel(id).await {
        Ok(outcome) => outcome,
        Err(SchedulerError::Unavailable) => {
            anyhow::bail!("Task {id} is running but no scheduler is reachable to signal it")
        }
        Err(e) => return Err(e).context("Cancel failed"),
    };

    if json {
        println!("{}", serde_json::json!({ "task_id": id, "outcome": outcome }));
    } else {
        eprintln!("{}", cancel_message(id, outcome));
    }
    Ok(())
}

fn cancel_message(id: TaskId, outcome: CancelOutcome) -> String {
    match outcome {
        CancelOutcome::Ack => format!("Task {id} cancelled"),
        // A terminating task has no status change left to make either.
        CancelOutcome::Noop => format!("Task {id} is finished or already stopping, nothing to do"),
    }
}

async fn cmd_stop(service: &TaskService, drain: DrainPolicy) -> Result<()> {
    match service.stop_scheduler(drain).await {
        Ok(()) => {
            eprintln!("Scheduler stopping ({})", drain_str(drain));
            Ok(())
        }
        Err(SchedulerError::Unavailable) => anyhow::bail!("No scheduler is running"),
        Err(e) => Err(e).context("Stop failed"),
    }
}

async fn cmd_status(service: &TaskService, json: bool) -> Result<()> {
    let status = match service.scheduler_status().await {
        Ok(status) => Some(status),
        Err(SchedulerError::Unavailable) => None,
        Err(e) => return Err(e).context("Status failed"),
    };

    if json {
        println!("{}", serde_json::json!({ "running": status.is_some(), "scheduler": status }));
        return Ok(());
    }

    let Some(status) = status else {
        println!("Scheduler: stopped");
        return Ok(());
    };

    match status.stopping {
        Some(drain) => println!("Scheduler: stopping ({})", drain_str(drain)),
        None => println!("Scheduler: running"),
    }
    println!("PID: {}", status.pid);
    println!("Since: {}", format_timestamp(status.started_at));
    println!(
        "Slots: {}/{} (poll every {}ms)",
        status.running.len(),
        status.concurrency,
        status.poll_interval_ms
    );
    for task in &status.running {
        println!(
            "  task {:<6} pid {:<8} {}{}",
            task.task_id,
            task.pid,
            format_duration_ms(task.elapsed_ms as i64),
            if task.terminating { " (terminating)" } else { "" }
        );
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn drain_str(drain: DrainPolicy) -> &'static str {
    match drain {
        DrainPolicy::Wait => "waiting for running tasks",
        DrainPolicy::Cancel => "cancelling running tasks",
    }
}

/// Resolve `path` against the current directory. Empty means the current
/// directory itself.
fn absolute(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(if path.as_os_str().is_empty() {
        cwd
    } else {
        cwd.join(path)
    })
}

fn parse_envs(envs: &[String]) -> Result<Vec<(String, String)>> {
    envs.iter()
        .map(|e| {
            let (key, value) = e
                .split_once('=')
                .with_context(|| format!("Invalid --env {e:?}, expected KEY=VALUE"))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
