//! Reaping children.

use std::io;

use crate::error::ProcError;
use crate::types::Pid;

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// `exit(code)`.
    Code(i32),
    /// Terminated by this signal number.
    Signaled(i32),
}

fn decode_status(status: libc::c_int) -> ExitStatus {
    if libc::WIFEXITED(status) {
        ExitStatus::Code(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        // Stopped/continued are not reported without WUNTRACED
        ExitStatus::Code(-1)
    }
}

/// Reap `pid` if it has exited, without blocking.
///
/// `Ok(None)` means it is still running. Once `Some` is returned the pid is
/// gone and must not be waited on again.
pub fn try_wait(pid: Pid) -> Result<Option<ExitStatus>, ProcError> {
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid.0, &mut status, libc::WNOHANG) };

    match result {
        0 => Ok(None),
        r if r > 0 => Ok(Some(decode_status(status))),
        _ => Err(ProcError::Wait(io::Error::last_os_error())),
    }
}
