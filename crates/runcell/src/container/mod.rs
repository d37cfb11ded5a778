//! Container-facing building blocks
//!
//! This module holds everything the orchestrator needs before and around a
//! container: identity mappings, cgroup paths, rlimit translation, stdio
//! files, the container specification, and the backend interface that
//! actually realizes namespaces and cgroups.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

pub use crate::container::cgroup::{CgroupError, CgroupPaths, remove_path};
pub use crate::container::idmap::{IdMapError, IdMapping, id_mappings};
pub use crate::container::native::NativeBackend;
pub use crate::container::rlimit::{
    LimitError, Rlimit, RlimitResource, TranslatedLimits, translate,
};
pub use crate::container::spec::{
    ContainerSpec, Identity, Namespace, ProcessSpec, SpecError, build_container_spec,
    build_process,
};
pub use crate::container::stdio::{NULL_DEVICE, ProcessStdio, StdioError, StdioFiles, provision};

pub mod cgroup;
mod idmap;
mod native;
mod rlimit;
mod spec;
mod stdio;

/// Errors reported by a container backend
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to create container {id}: {message}")]
    CreateFailed { id: String, message: String },

    #[error("failed to start process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("process has not been started")]
    NotStarted,

    #[error("process has already been started")]
    AlreadyStarted,

    #[error("failed to send signal {signal}: {source}")]
    SignalFailed {
        signal: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read statistics from {path}: {message}")]
    StatsFailed { path: PathBuf, message: String },

    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the container's init process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Exited normally with a code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
}

impl TerminalState {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TerminalState::Exited(code) => Some(*code),
            TerminalState::Signaled(_) => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            TerminalState::Exited(_) => None,
            TerminalState::Signaled(signal) => Some(*signal),
        }
    }
}

impl From<std::process::ExitStatus> for TerminalState {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => TerminalState::Exited(code),
            (None, Some(signal)) => TerminalState::Signaled(signal),
            // Stopped/continued statuses never reach a reaped child
            (None, None) => TerminalState::Exited(-1),
        }
    }
}

/// Raw cgroup counters for a finished container.
///
/// Every field is optional because backends without cgroup access cannot
/// provide them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    /// `usage_usec` from cpu.stat
    pub cpu_usage_usec: Option<u64>,
    /// `user_usec` from cpu.stat
    pub cpu_user_usec: Option<u64>,
    /// `system_usec` from cpu.stat
    pub cpu_system_usec: Option<u64>,
    /// memory.peak in bytes
    pub memory_peak_bytes: Option<u64>,
    /// `oom_kill` from memory.events
    pub oom_kill_count: Option<u64>,
}

/// Creates containers
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    type Container: Container;

    /// Create a container without starting any process in it
    async fn create(
        &self,
        id: &str,
        spec: &ContainerSpec,
    ) -> Result<Self::Container, ContainerError>;
}

/// A created container that runs exactly one process tree
#[async_trait]
pub trait Container: Send + Sync {
    /// Start the init process
    async fn run(&self, process: ProcessSpec) -> Result<(), ContainerError>;

    /// Wait for the init process to terminate.
    ///
    /// Must be callable while [`signal`](Self::signal) is used concurrently.
    async fn wait(&self) -> Result<TerminalState, ContainerError>;

    /// Send `signal` to the init process, or to every process in the
    /// container when `all` is set
    fn signal(&self, signal: i32, all: bool) -> Result<(), ContainerError>;

    /// Read final resource usage
    async fn stats(&self) -> Result<Statistics, ContainerError>;

    /// Tear the container down, killing anything left in it
    async fn destroy(&self) -> Result<(), ContainerError>;
}

static INSTANCE_ID: LazyLock<String> = LazyLock::new(|| {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..12].to_string()
});

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier of this process, shared by every container it creates
pub fn instance_id() -> &'static str {
    &INSTANCE_ID
}

/// Allocate a container id unique across concurrent runs
pub fn next_container_id() -> String {
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("runcell-{}-{sequence}", instance_id())
}
