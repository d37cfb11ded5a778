use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../runcell.example.toml");

/// PATH every sandboxed process starts with
pub const DEFAULT_SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// uid/gid of `nobody`
pub const NOBODY_ID: u32 = 65534;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("failed to parse execution config: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("unsupported config format for {0}")]
    UnsupportedFormat(PathBuf),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Runcell
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base cgroup used when an execution config does not name one.
    ///
    /// Relative paths are resolved against the cgroup v2 mount point.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// The safety-net deadline is this many times the soft time limit.
    #[serde(default = "default_safety_net_multiplier")]
    pub safety_net_multiplier: u32,

    /// Safety-net deadline in milliseconds for runs without a time limit.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// PATH prefix for every sandboxed process
    #[serde(default = "default_system_path")]
    pub system_path: String,

    #[serde(default = "default_sandbox_id")]
    pub sandbox_uid: u32,

    #[serde(default = "default_sandbox_id")]
    pub sandbox_gid: u32,

    /// Hostname seen inside the container
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config with every field at its built-in default
    pub fn builtin() -> Self {
        Self {
            cgroup_root: default_cgroup_root(),
            safety_net_multiplier: default_safety_net_multiplier(),
            default_deadline_ms: default_deadline_ms(),
            system_path: default_system_path(),
            sandbox_uid: default_sandbox_id(),
            sandbox_gid: default_sandbox_id(),
            hostname: default_hostname(),
        }
    }

    /// Safety-net deadline for a run with the given soft time limit
    pub fn safety_net_ms(&self, time_limit_ms: Option<u64>) -> u64 {
        match time_limit_ms {
            Some(ms) => ms.saturating_mul(u64::from(self.safety_net_multiplier)),
            None => self.default_deadline_ms,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/runcell")
}

fn default_safety_net_multiplier() -> u32 {
    3
}

fn default_deadline_ms() -> u64 {
    10 * 60 * 1000
}

fn default_system_path() -> String {
    DEFAULT_SYSTEM_PATH.to_string()
}

fn default_sandbox_id() -> u32 {
    NOBODY_ID
}

fn default_hostname() -> String {
    "runcell".to_string()
}
