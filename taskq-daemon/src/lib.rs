//! taskq daemon: durable store, scheduler and process supervision.
//!
//! The `taskqd` binary and the `taskq` CLI are both thin shells over this
//! crate. [`server::serve`] runs a scheduler; [`TaskService`] is the client
//! side used for submissions, queries and control requests.

pub mod config;
pub mod control;
pub mod convert;
pub mod db;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod supervisor;

pub use config::{ConfigError, DataPaths, DrainPolicy, SchedulerArgs, SchedulerConfig};
pub use control::{ControlClient, ControlError, ControlServer};
pub use convert::{task_to_view, TaskDetail, TaskView};
pub use db::TaskOrder;
pub use scheduler::{
    CancelOutcome, RunningTask, Scheduler, SchedulerError, SchedulerHandle, SchedulerStatus,
};
pub use server::ServeError;
pub use service::TaskService;
pub use store::{StoreError, TaskStore};
