//! Process control for taskq.
//!
//! This crate wraps the handful of Unix syscalls the scheduler needs: spawning
//! a shell command into its own process group with redirected output, polling
//! for its exit status, and signalling the whole group.
//!
//! # Example
//!
//! ```no_run
//! use taskq_proc::{spawn_shell, signal_pgid, try_wait, Signal, SpawnSpec};
//!
//! let spec = SpawnSpec::new("sleep 30")
//!     .unwrap()
//!     .cwd("/tmp")
//!     .stdout("/tmp/sleep.log");
//!
//! let child = spawn_shell(spec).unwrap();
//!
//! if try_wait(child.pid).unwrap().is_none() {
//!     signal_pgid(child.pgid, Signal::Term).unwrap();
//! }
//! ```

mod error;
mod signal;
mod spawn;
mod types;
mod wait;

pub use error::ProcError;
pub use signal::{is_alive, signal_pgid, Signal};
pub use spawn::{spawn_shell, SpawnSpec};
pub use types::{Child, Pid, ProcessGroupId};
pub use wait::{try_wait, ExitStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::{Duration, Instant};

    const OK: ExitStatus = ExitStatus::Code(0);

    fn reap(pid: Pid) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = try_wait(pid).unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "{pid} did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn run(spec: SpawnSpec) -> ExitStatus {
        let child = spawn_shell(spec).unwrap();
        reap(child.pid)
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(run(SpawnSpec::new("true").unwrap()), OK);
        assert_eq!(run(SpawnSpec::new("false").unwrap()), ExitStatus::Code(1));
        assert_eq!(run(SpawnSpec::new("exit 7").unwrap()), ExitStatus::Code(7));
    }

    #[test]
    fn test_spawn_unknown_command_exits_127() {
        let status = run(SpawnSpec::new("/nonexistent/path/to/program").unwrap());
        assert_eq!(status, ExitStatus::Code(127));
    }

    #[test]
    fn test_spawn_missing_cwd_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec::new("true")
            .unwrap()
            .cwd(dir.path().join("gone"));

        let err = spawn_shell(spec).unwrap_err();
        assert!(matches!(err, ProcError::Spawn(_)), "got {err:?}");
    }

    #[test]
    fn test_output_redirect_appends() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.log");
        let err = dir.path().join("err.log");

        for word in ["one", "two"] {
            let spec = SpawnSpec::new(format!("echo {word}; echo oops-{word} >&2"))
                .unwrap()
                .stdout(&out)
                .stderr(&err);
            assert_eq!(run(spec), OK);
        }

        assert_eq!(fs::read_to_string(&out).unwrap(), "one\ntwo\n");
        assert_eq!(fs::read_to_string(&err).unwrap(), "oops-one\noops-two\n");
    }

    #[test]
    fn test_output_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec::new("true")
            .unwrap()
            .stdout(dir.path().join("nope").join("out.log"));

        let err = spawn_shell(spec).unwrap_err();
        assert!(matches!(err, ProcError::OpenOutput { .. }), "got {err:?}");
    }

    #[test]
    fn test_env_replaces_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.log");

        let mut env = BTreeMap::new();
        env.insert("TEST_VAR".to_string(), "test_value".to_string());

        let spec = SpawnSpec::new("echo \"$TEST_VAR:${HOME:-unset}\"")
            .unwrap()
            .env(env)
            .stdout(&out);
        assert_eq!(run(spec), OK);

        assert_eq!(fs::read_to_string(&out).unwrap(), "test_value:unset\n");
    }

    #[test]
    fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("pwd.log");

        let spec = SpawnSpec::new("pwd -P")
            .unwrap()
            .cwd(dir.path())
            .stdout(&out);
        assert_eq!(run(spec), OK);

        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            fs::read_to_string(&out).unwrap().trim_end(),
            expected.to_string_lossy()
        );
    }

    #[test]
    fn test_try_wait_running_then_kill_group() {
        let child = spawn_shell(SpawnSpec::new("sleep 10").unwrap()).unwrap();
        assert_eq!(child.pgid.as_raw(), child.pid.as_raw());

        assert!(try_wait(child.pid).unwrap().is_none());
        assert!(is_alive(child.pid));

        signal_pgid(child.pgid, Signal::Kill).unwrap();

        assert_eq!(reap(child.pid), ExitStatus::Signaled(libc::SIGKILL));
        assert!(!is_alive(child.pid));
    }

    #[test]
    fn test_signal_gone_group() {
        let child = spawn_shell(SpawnSpec::new("true").unwrap()).unwrap();
        reap(child.pid);

        let err = signal_pgid(child.pgid, Signal::Term).unwrap_err();
        assert!(err.is_gone());

        let err = try_wait(child.pid).unwrap_err();
        assert!(err.is_gone());
    }

    #[test]
    fn test_nul_in_command_rejected() {
        assert!(matches!(
            SpawnSpec::new("echo a\0b"),
            Err(ProcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pid_accessors() {
        let pid = Pid::new(1234);
        assert_eq!(pid.as_raw(), 1234);
        assert_eq!(pid.to_string(), "1234");
        assert_eq!(ProcessGroupId::new(5678).as_raw(), 5678);
    }
}
