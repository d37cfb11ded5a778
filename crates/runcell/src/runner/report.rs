//! Turning a terminated process into an [`ExecutionReport`]

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::container::{NULL_DEVICE, Statistics, TerminalState};
use crate::types::{ExecutionConfig, ExecutionReport, ExecutionStatus, ResourceUsage};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read output file metadata at {path}: {source}")]
    OutputMetadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raw outcome of a run
#[derive(Debug)]
pub struct ReportInput<'a> {
    pub exec: &'a ExecutionConfig,
    pub state: TerminalState,
    pub stats: Statistics,
    pub wall_time: Duration,
    pub wall_time_limit_exceeded: bool,
    pub cgroup_path: &'a Path,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Configured fsize hard limit, before the enforcement margin
    pub fsize_baseline: Option<u64>,
}

/// Build the report for a finished run.
///
/// The only I/O is reading the output file sizes, and only when the process
/// died from `SIGXFSZ` with an fsize limit configured.
pub async fn build(input: ReportInput<'_>) -> Result<ExecutionReport, ReportError> {
    let fsize_limit_exceeded = fsize_limit_exceeded(&input).await?;
    let resource_usage = resource_usage(&input.stats);
    let status = classify(
        input.state,
        input.wall_time_limit_exceeded,
        fsize_limit_exceeded,
        &resource_usage,
        input.exec.time_limit_ms(),
    );

    debug!(
        ?status,
        state = ?input.state,
        cgroup = %input.cgroup_path.display(),
        wall_time_ms = input.wall_time.as_millis() as u64,
        "report built"
    );

    Ok(ExecutionReport {
        status,
        exit_code: input.state.exit_code(),
        signal: input.state.signal(),
        wall_time_ms: u64::try_from(input.wall_time.as_millis()).unwrap_or(u64::MAX),
        wall_time_limit_exceeded: input.wall_time_limit_exceeded,
        fsize_limit_exceeded,
        resource_usage,
        stdout_path: input.stdout_path,
        stderr_path: input.stderr_path,
    })
}

async fn fsize_limit_exceeded(input: &ReportInput<'_>) -> Result<bool, ReportError> {
    if input.state.signal() != Some(libc::SIGXFSZ) {
        return Ok(false);
    }

    // SIGXFSZ alone may come from a kill(2) by the program itself
    let Some(baseline) = input.fsize_baseline else {
        return Ok(false);
    };

    let stdout = output_size(&input.stdout_path).await?;
    let stderr = output_size(&input.stderr_path).await?;
    Ok(stdout.max(stderr) > baseline)
}

async fn output_size(path: &Path) -> Result<u64, ReportError> {
    if path == Path::new(NULL_DEVICE) {
        return Ok(0);
    }

    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .map_err(|source| ReportError::OutputMetadata {
            path: path.to_path_buf(),
            source,
        })
}

fn resource_usage(stats: &Statistics) -> ResourceUsage {
    ResourceUsage {
        cpu_time_ms: stats.cpu_usage_usec.map(|usec| usec / 1000),
        cpu_user_time_ms: stats.cpu_user_usec.map(|usec| usec / 1000),
        cpu_kernel_time_ms: stats.cpu_system_usec.map(|usec| usec / 1000),
        memory_peak_kib: stats.memory_peak_bytes.map(|bytes| bytes / 1024),
        oom_killed: stats.oom_kill_count.is_some_and(|count| count > 0),
    }
}

/// Pick the status, most specific cause first
fn classify(
    state: TerminalState,
    wall_time_limit_exceeded: bool,
    fsize_limit_exceeded: bool,
    usage: &ResourceUsage,
    time_limit_ms: Option<u64>,
) -> ExecutionStatus {
    if wall_time_limit_exceeded {
        return ExecutionStatus::WallTimeLimitExceeded;
    }
    if usage.oom_killed {
        return ExecutionStatus::MemoryLimitExceeded;
    }
    if fsize_limit_exceeded {
        return ExecutionStatus::OutputLimitExceeded;
    }
    if let (Some(limit), Some(user)) = (time_limit_ms, usage.cpu_user_time_ms)
        && user > limit
    {
        return ExecutionStatus::UserTimeLimitExceeded;
    }

    match state {
        TerminalState::Signaled(_) => ExecutionStatus::SignalTerminate,
        TerminalState::Exited(0) => ExecutionStatus::Normal,
        TerminalState::Exited(_) => ExecutionStatus::RuntimeError,
    }
}
