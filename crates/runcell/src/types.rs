use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Description of a single sandboxed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Program and arguments
    pub command: Vec<String>,

    /// Working directory inside the container
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Extra PATH segments appended after the system default
    #[serde(default)]
    pub paths: Vec<String>,

    /// User namespace remapping; the host namespace is shared when absent
    #[serde(default)]
    pub user_namespace: Option<UserNamespaceConfig>,

    /// Base cgroup the run is confined under.
    /// Falls back to [`Config::cgroup_root`](crate::Config::cgroup_root).
    #[serde(default)]
    pub cgroup_path: Option<PathBuf>,

    #[serde(default)]
    pub limits: Option<ExecutionLimits>,

    #[serde(default)]
    pub fd: Option<FdConfig>,
}

impl ExecutionConfig {
    /// Create a config running `command` with no limits and null stdio
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: default_cwd(),
            paths: Vec::new(),
            user_namespace: None,
            cgroup_path: None,
            limits: None,
            fd: None,
        }
    }

    /// Set the soft time limit in milliseconds
    pub fn with_time_limit(mut self, time_ms: u64) -> Self {
        self.limits.get_or_insert_with(Default::default).time_ms = time_ms;
        self
    }

    /// Set the output size limit in bytes (soft and hard)
    pub fn with_output_limit(mut self, bytes: u64) -> Self {
        let limits = self.limits.get_or_insert_with(Default::default);
        limits.rlimit.get_or_insert_with(Default::default).fsize = Some(RlimitItem {
            soft: bytes,
            hard: bytes,
        });
        self
    }

    /// Set the cgroup base path
    pub fn with_cgroup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup_path = Some(path.into());
        self
    }

    /// Set the stdio files
    pub fn with_fd(mut self, fd: FdConfig) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Whether the run needs a remapped user namespace
    pub fn user_namespace_enabled(&self) -> bool {
        self.user_namespace.as_ref().is_some_and(|ns| ns.enabled)
    }

    /// The configured soft time limit, if any
    pub fn time_limit_ms(&self) -> Option<u64> {
        self.limits
            .as_ref()
            .map(|limits| limits.time_ms)
            .filter(|ms| *ms > 0)
    }

    /// Reject configs that can never run
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.command.first() {
            None => return Err(ConfigError::Invalid("command is empty".to_string())),
            Some(program) if program.is_empty() => {
                return Err(ConfigError::Invalid("command has empty program".to_string()));
            }
            Some(_) => {}
        }

        let rlimit = self.limits.as_ref().and_then(|limits| limits.rlimit.as_ref());
        if let Some(rlimit) = rlimit {
            for (name, item) in rlimit.items() {
                if item.soft > item.hard {
                    return Err(ConfigError::Invalid(format!(
                        "rlimit {name} has soft limit {} above hard limit {}",
                        item.soft, item.hard
                    )));
                }
            }
        }

        Ok(())
    }
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// Identity remapping for a user-namespaced container.
///
/// Container root maps to `root_uid`; container ids from 1 upward map onto
/// the subordinate range starting at `uid_map_begin`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNamespaceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub root_uid: u32,
    #[serde(default)]
    pub uid_map_begin: u32,
    #[serde(default)]
    pub uid_map_count: u32,
    #[serde(default)]
    pub root_gid: u32,
    #[serde(default)]
    pub gid_map_begin: u32,
    #[serde(default)]
    pub gid_map_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Soft time limit in milliseconds, 0 when unset
    #[serde(default)]
    pub time_ms: u64,

    /// cgroup memory limit in kilobytes
    #[serde(default)]
    pub memory_kib: Option<u64>,

    /// cgroup limit on the number of processes/threads
    #[serde(default)]
    pub pids_count: Option<u64>,

    #[serde(default)]
    pub rlimit: Option<RlimitConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RlimitConfig {
    /// Core dump size in bytes
    #[serde(default)]
    pub core: Option<RlimitItem>,

    /// Open file descriptors
    #[serde(default)]
    pub no_file: Option<RlimitItem>,

    /// Largest file the process may write, in bytes
    #[serde(default)]
    pub fsize: Option<RlimitItem>,
}

impl RlimitConfig {
    /// Configured limits with their names
    pub fn items(&self) -> impl Iterator<Item = (&'static str, &RlimitItem)> {
        [
            ("core", self.core.as_ref()),
            ("no_file", self.no_file.as_ref()),
            ("fsize", self.fsize.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, item)| item.map(|item| (name, item)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitItem {
    pub soft: u64,
    pub hard: u64,
}

/// Files bound to the standard streams; unset entries use the null device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FdConfig {
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

/// Result of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,

    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the process was killed by a signal
    pub signal: Option<i32>,

    pub wall_time_ms: u64,

    /// The safety-net deadline fired before the process finished
    pub wall_time_limit_exceeded: bool,

    /// The process was stopped for writing past the configured fsize limit
    pub fsize_limit_exceeded: bool,

    pub resource_usage: ResourceUsage,

    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ExecutionReport {
    /// Check if the process exited normally with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Normal) && self.exit_code == Some(0)
    }
}

/// Resource usage collected from the run's cgroup.
/// Fields are `None` when the backend had no cgroup to read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User plus kernel time
    pub cpu_time_ms: Option<u64>,
    pub cpu_user_time_ms: Option<u64>,
    pub cpu_kernel_time_ms: Option<u64>,
    pub memory_peak_kib: Option<u64>,
    pub oom_killed: bool,
}

/// Judge-facing classification of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Exited with code 0
    Normal,

    /// Exited with a non-zero code
    RuntimeError,

    /// Killed by a signal not attributable to a limit
    SignalTerminate,

    /// CPU user time went over the soft time limit
    UserTimeLimitExceeded,

    /// The safety-net deadline fired
    WallTimeLimitExceeded,

    /// The cgroup OOM killer fired
    MemoryLimitExceeded,

    /// Output went past the fsize limit
    OutputLimitExceeded,
}

impl ExecutionStatus {
    /// Check if any limit was exceeded
    #[must_use]
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::UserTimeLimitExceeded
                | ExecutionStatus::WallTimeLimitExceeded
                | ExecutionStatus::MemoryLimitExceeded
                | ExecutionStatus::OutputLimitExceeded
        )
    }
}
