//! Shell child spawning.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::ProcError;
use crate::types::{Child, Pid, ProcessGroupId};

const SHELL: &str = "/bin/sh";

/// Specification for spawning a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Command string passed to `/bin/sh -c`.
    pub command: String,
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Full environment for the child. `None` inherits ours.
    pub env: Option<BTreeMap<String, String>>,
    /// File to append stdout to. `None` discards it.
    pub stdout: Option<PathBuf>,
    /// File to append stderr to. `None` discards it.
    pub stderr: Option<PathBuf>,
}

impl SpawnSpec {
    /// Create a new SpawnSpec running `command` under `/bin/sh`.
    pub fn new(command: impl Into<String>) -> Result<Self, ProcError> {
        let command = command.into();
        if command.contains('\0') {
            return Err(ProcError::InvalidArgument(
                "command contains a NUL byte".to_string(),
            ));
        }
        Ok(Self {
            command,
            cwd: PathBuf::from("/"),
            env: None,
            stdout: None,
            stderr: None,
        })
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Replace the child's environment.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Append stdout to a file.
    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Append stderr to a file.
    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }
}

fn open_output(path: Option<&Path>) -> Result<Stdio, ProcError> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };
    let file: File = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ProcError::OpenOutput {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Stdio::from(file))
}

/// Spawn `/bin/sh -c <command>` as the leader of a new process group.
///
/// stdin is `/dev/null`. The returned [`Child`] must be reaped by the caller
/// with [`crate::try_wait`].
pub fn spawn_shell(spec: SpawnSpec) -> Result<Child, ProcError> {
    let stdout = open_output(spec.stdout.as_deref())?;
    let stderr = open_output(spec.stderr.as_deref())?;

    let mut cmd = Command::new(SHELL);
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);

    if let Some(env) = &spec.env {
        cmd.env_clear().envs(env);
    }

    // chdir/exec failures in the child surface here as an Err.
    let child = cmd.spawn().map_err(ProcError::Spawn)?;
    let pid = child.id() as i32;
    // std's Child never reaps on drop; the caller owns the waitpid.
    drop(child);

    Ok(Child {
        pid: Pid::new(pid),
        pgid: ProcessGroupId::new(pid),
    })
}
