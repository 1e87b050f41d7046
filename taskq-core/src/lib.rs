//! # taskq core
//!
//! Pure domain types and business logic for the taskq command queue.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No process spawning
//! - No database interactions
//!
//! Everything here is plain Rust structs/enums with serde serialization. The
//! IO (process execution, persistence, the control socket) lives in
//! `taskq-daemon` and `taskq-proc`.
//!
//! ## Modules
//!
//! - [`task`] - Task record, statuses and the lifecycle state machine
//! - [`submit`] - Submission requests and their validation

pub mod submit;
pub mod task;

// Re-export commonly used types at crate root for convenience.
pub use submit::{NewTask, SubmissionError, MAX_TIMEOUT_SECS};
pub use task::{
    CancelSource, InvalidTransition, Priority, StatusSet, Task, TaskEvent, TaskEventKind, TaskId,
    TaskStatus, UnknownStatus, ORPHANED_REASON,
};
