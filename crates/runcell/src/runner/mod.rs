//! Execution orchestration for Runcell
//!
//! Provides the single entry point that turns an [`ExecutionConfig`] into an
//! [`ExecutionReport`]: build the container, run the process under the
//! safety-net deadline and caller cancellation, collect statistics and tear
//! everything down again.

use thiserror::Error;
use tokio::sync::watch;

pub use crate::runner::execute::execute;
pub use crate::runner::report::{ReportError, ReportInput};

mod execute;
pub mod report;

use crate::{
    config::{Config, ConfigError},
    container::{
        CgroupError, ContainerBackend, ContainerError, IdMapError, LimitError, SpecError,
        StdioError,
    },
    types::{ExecutionConfig, ExecutionReport},
};

/// Errors that end a run without a report
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("invalid execution config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to compute id mappings: {0}")]
    IdMapping(#[from] IdMapError),

    #[error("failed to resolve cgroup: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("failed to build container spec: {0}")]
    Spec(#[from] SpecError),

    #[error("failed to create container: {0}")]
    Create(#[source] ContainerError),

    #[error("failed to provision stdio: {0}")]
    Stdio(#[from] StdioError),

    #[error("invalid resource limits: {0}")]
    Limits(#[from] LimitError),

    #[error("failed to start process: {0}")]
    Launch(#[source] ContainerError),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] ContainerError),

    #[error("failed to kill process: {0}")]
    Signal(#[source] ContainerError),

    #[error("execution cancelled")]
    Cancelled,

    #[error("failed to collect statistics: {0}")]
    Stats(#[source] ContainerError),

    #[error("failed to build report: {0}")]
    Report(#[from] ReportError),
}

/// Coarse classification of an [`ExecuteError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Failed before the process was started
    Setup,
    /// The process could not be started, waited on or killed
    Launch,
    /// The caller cancelled the run
    Cancelled,
    /// The run finished but its outcome could not be read back
    ReportResolution,
}

impl ExecuteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecuteError::InvalidConfig(_)
            | ExecuteError::IdMapping(_)
            | ExecuteError::Cgroup(_)
            | ExecuteError::Spec(_)
            | ExecuteError::Create(_)
            | ExecuteError::Stdio(_)
            | ExecuteError::Limits(_) => ErrorKind::Setup,
            ExecuteError::Launch(_) | ExecuteError::Wait(_) | ExecuteError::Signal(_) => {
                ErrorKind::Launch
            }
            ExecuteError::Cancelled => ErrorKind::Cancelled,
            ExecuteError::Stats(_) | ExecuteError::Report(_) => ErrorKind::ReportResolution,
        }
    }
}

/// Create a connected cancellation pair
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Requests cancellation of a run
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by a run to learn about cancellation.
///
/// Dropping the paired [`CancelHandle`] without cancelling never cancels.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone without cancelling
            std::future::pending::<()>().await;
        }
    }
}

/// Runs executions against a backend with a fixed configuration
#[derive(Debug, Clone)]
pub struct Runner<B> {
    config: Config,
    backend: B,
}

impl<B: ContainerBackend> Runner<B> {
    /// Create a new runner with the given configuration
    pub fn new(config: Config, backend: B) -> Self {
        Self { config, backend }
    }

    /// Create a new runner with default configuration
    pub fn with_defaults(backend: B) -> Self {
        Self::new(Config::default(), backend)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one execution to completion
    pub async fn run(
        &self,
        exec: &ExecutionConfig,
        cancel: CancelSignal,
    ) -> Result<ExecutionReport, ExecuteError> {
        execute::execute(&self.backend, &self.config, exec, cancel).await
    }
}
