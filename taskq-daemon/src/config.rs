//! Scheduler configuration and data directory layout.
//!
//! Values are resolved in three layers: built-in defaults, then `TASKQ_*`
//! environment variables (including a `.env` file loaded by the binaries),
//! then command-line flags.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskq_core::MAX_TIMEOUT_SECS;

pub const ENV_HOME: &str = "TASKQ_HOME";
pub const ENV_CONCURRENCY: &str = "TASKQ_CONCURRENCY";
pub const ENV_POLL_INTERVAL_MS: &str = "TASKQ_POLL_INTERVAL_MS";
pub const ENV_DEFAULT_TIMEOUT_SECS: &str = "TASKQ_DEFAULT_TIMEOUT_SECS";
pub const ENV_GRACE_PERIOD_SECS: &str = "TASKQ_GRACE_PERIOD_SECS";
pub const ENV_DRAIN: &str = "TASKQ_DRAIN";

const DB_FILE: &str = "taskq.db";
const SOCKET_FILE: &str = "scheduler.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("{what} is out of range (max {max}s)", max = MAX_TIMEOUT_SECS)]
    OutOfRange { what: &'static str },

    #[error("cannot determine a data directory; set TASKQ_HOME or pass --data-dir")]
    NoDataDir,

    #[error("cannot create data directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happens to in-flight tasks when the scheduler is asked to stop.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Stop admitting; let running tasks finish.
    #[default]
    Wait,
    /// Stop admitting; cancel running tasks (SIGTERM, then SIGKILL).
    Cancel,
}

impl FromStr for DrainPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(DrainPolicy::Wait),
            "cancel" => Ok(DrainPolicy::Cancel),
            _ => Err("expected 'wait' or 'cancel'".to_string()),
        }
    }
}

/// Tunables for the scheduler loop and process supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once.
    pub concurrency: usize,
    /// How often the loop polls for pending work.
    pub poll_interval: Duration,
    /// Timeout applied to tasks submitted without one.
    pub default_timeout: Option<Duration>,
    /// Delay between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Behaviour on stop when no explicit policy is given (signals).
    pub drain: DrainPolicy,
    /// How often each watcher polls its child for exit.
    pub exit_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            default_timeout: None,
            grace_period: Duration::from_secs(5),
            drain: DrainPolicy::Wait,
            exit_poll_interval: Duration::from_millis(50),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with `TASKQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, ENV_CONCURRENCY)? {
            config.concurrency = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_DEFAULT_TIMEOUT_SECS)? {
            config.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_GRACE_PERIOD_SECS)? {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(drain) = parse_var::<DrainPolicy>(&lookup, ENV_DRAIN)? {
            config.drain = drain;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.poll_interval.is_zero() || self.exit_poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        let limit = Duration::from_secs(MAX_TIMEOUT_SECS);
        for (what, value) in [
            ("default timeout", self.default_timeout),
            ("grace period", Some(self.grace_period)),
            ("poll interval", Some(self.poll_interval)),
            ("exit poll interval", Some(self.exit_poll_interval)),
        ] {
            if value.is_some_and(|v| v > limit) {
                return Err(ConfigError::OutOfRange { what });
            }
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    if value.trim().is_empty() {
        return Ok(None);
    }
    let parsed = value.trim().parse::<T>();
    parsed
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        })
}

/// Scheduler flags shared by `taskqd` and `taskq start`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct SchedulerArgs {
    /// Maximum number of tasks running at once [env: TASKQ_CONCURRENCY]
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Poll interval for pending tasks, in milliseconds [env: TASKQ_POLL_INTERVAL_MS]
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Timeout for tasks submitted without one; 0 disables [env: TASKQ_DEFAULT_TIMEOUT_SECS]
    #[arg(long, value_name = "SECS")]
    pub default_timeout: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL [env: TASKQ_GRACE_PERIOD_SECS]
    #[arg(long, value_name = "SECS")]
    pub grace_period: Option<u64>,

    /// What to do with running tasks on SIGINT/SIGTERM [env: TASKQ_DRAIN]
    #[arg(long, value_enum)]
    pub drain: Option<DrainPolicy>,
}

impl SchedulerArgs {
    /// Resolve defaults, environment and flags into a validated config.
    pub fn resolve(&self) -> Result<SchedulerConfig, ConfigError> {
        self.apply(SchedulerConfig::from_env()?)
    }

    fn apply(&self, mut config: SchedulerConfig) -> Result<SchedulerConfig, ConfigError> {
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.default_timeout {
            config.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = self.grace_period {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(drain) = self.drain {
            config.drain = drain;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Files under the taskq data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--data-dir`, else `$TASKQ_HOME`, else the platform data directory.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(home) = std::env::var_os(ENV_HOME).filter(|v| !v.is_empty()) {
            return Ok(Self::new(home));
        }
        dirs::data_local_dir()
            .map(|dir| Self::new(dir.join("taskq")))
            .ok_or(ConfigError::NoDataDir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join(SOCKET_FILE)
    }

    /// Create the data directory if missing.
    pub fn ensure(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.root).map_err(|source| ConfigError::CreateDir {
            path: self.root.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.default_timeout, None);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.drain, DrainPolicy::Wait);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            (ENV_CONCURRENCY, "4"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_DEFAULT_TIMEOUT_SECS, "60"),
            (ENV_GRACE_PERIOD_SECS, "2"),
            (ENV_DRAIN, "Cancel"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.default_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.drain, DrainPolicy::Cancel);
    }

    #[test]
    fn zero_default_timeout_means_none() {
        let config =
            SchedulerConfig::from_lookup(lookup(&[(ENV_DEFAULT_TIMEOUT_SECS, "0")])).unwrap();
        assert_eq!(config.default_timeout, None);
    }

    #[test]
    fn invalid_env_value() {
        let err = SchedulerConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: ENV_CONCURRENCY,
                ..
            }
        ));

        let err = SchedulerConfig::from_lookup(lookup(&[(ENV_DRAIN, "later")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_DRAIN, .. }));
    }

    #[test]
    fn flags_override_env() {
        let base = SchedulerConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "4")])).unwrap();
        let args = SchedulerArgs {
            concurrency: Some(2),
            default_timeout: Some(0),
            drain: Some(DrainPolicy::Cancel),
            ..Default::default()
        };

        let config = args.apply(base).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.default_timeout, None);
        assert_eq!(config.drain, DrainPolicy::Cancel);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let args = SchedulerArgs {
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            args.apply(SchedulerConfig::default()),
            Err(ConfigError::ZeroConcurrency)
        ));

        let args = SchedulerArgs {
            poll_interval_ms: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            args.apply(SchedulerConfig::default()),
            Err(ConfigError::ZeroPollInterval)
        ));
    }

    #[test]
    fn huge_durations_rejected() {
        let huge = (MAX_TIMEOUT_SECS + 1).to_string();

        let config =
            SchedulerConfig::from_lookup(lookup(&[(ENV_DEFAULT_TIMEOUT_SECS, huge.as_str())]))
                .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                what: "default timeout"
            }
        ));

        let args = SchedulerArgs {
            grace_period: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            args.apply(SchedulerConfig::default()),
            Err(ConfigError::OutOfRange {
                what: "grace period"
            })
        ));
    }

    #[test]
    fn data_paths_layout() {
        let paths = DataPaths::resolve(Some(PathBuf::from("/var/lib/taskq"))).unwrap();
        assert_eq!(paths.root(), Path::new("/var/lib/taskq"));
        assert_eq!(paths.db_path(), PathBuf::from("/var/lib/taskq/taskq.db"));
        assert_eq!(
            paths.socket_path(),
            PathBuf::from("/var/lib/taskq/scheduler.sock")
        );
    }
}
