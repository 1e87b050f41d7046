//! Signal delivery.

use std::io;

use crate::error::ProcError;
use crate::types::{Pid, ProcessGroupId};

/// Signals the supervisor sends to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite stop, sent first.
    Term,
    /// Sent once the grace period is over.
    Kill,
}

impl Signal {
    pub fn to_libc(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Send a signal to every process in a group.
///
/// Reaches the shell and anything it forked, so pipelines and
/// backgrounded jobs are terminated along with it.
pub fn signal_pgid(pgid: ProcessGroupId, sig: Signal) -> Result<(), ProcError> {
    // Negative pid means send to process group
    let ret = unsafe { libc::kill(-pgid.0, sig.to_libc()) };
    if ret != 0 {
        return Err(ProcError::Signal(io::Error::last_os_error()));
    }
    Ok(())
}

/// Probe a pid with signal 0.
///
/// An unreaped zombie still counts as alive.
pub fn is_alive(pid: Pid) -> bool {
    let ret = unsafe { libc::kill(pid.0, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
