//! Process layer error types.

use std::io;
use std::path::PathBuf;

/// Errors that can occur while spawning or controlling a child process.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    /// The shell could not be started (missing cwd, exec failure, fork failure).
    #[error("spawn failed: {0}")]
    Spawn(#[source] io::Error),

    /// An output redirection file could not be opened.
    #[error("cannot open {}: {source}", path.display())]
    OpenOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// kill() failed.
    #[error("signal failed: {0}")]
    Signal(#[source] io::Error),

    /// waitpid() failed.
    #[error("waitpid failed: {0}")]
    Wait(#[source] io::Error),

    /// Invalid argument string (contains null bytes).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ProcError {
    /// True when the target process (or group) no longer exists.
    pub fn is_gone(&self) -> bool {
        match self {
            ProcError::Signal(e) => e.raw_os_error() == Some(libc::ESRCH),
            ProcError::Wait(e) => e.raw_os_error() == Some(libc::ECHILD),
            _ => false,
        }
    }
}
