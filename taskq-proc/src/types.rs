//! Core process types.

use std::fmt;

/// Process ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl Pid {
    /// Create a new Pid.
    pub fn new(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the raw pid value.
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process group ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessGroupId(pub i32);

impl ProcessGroupId {
    /// Create a new ProcessGroupId.
    pub fn new(pgid: i32) -> Self {
        Self(pgid)
    }

    /// Get the raw pgid value.
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

/// A spawned shell, leader of its own process group.
///
/// Dropping a `Child` does not reap it; poll [`crate::try_wait`] until it
/// reports the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    /// The shell's process ID.
    pub pid: Pid,
    /// The process group ID (equal to `pid`).
    pub pgid: ProcessGroupId,
}
