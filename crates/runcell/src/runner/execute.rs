//! The execution orchestrator
//!
//! Builds the container, starts the process and races its completion
//! against caller cancellation and the safety-net deadline. Whatever
//! happens, the container is destroyed and its cgroups removed before
//! returning.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::container::{
    CgroupPaths, Container, ContainerBackend, IdMapping, TerminalState, build_container_spec,
    build_process, id_mappings, next_container_id, provision, translate,
};
use crate::runner::report::{self, ReportInput};
use crate::runner::{CancelSignal, ExecuteError};
use crate::types::{ExecutionConfig, ExecutionReport};

/// Fallback deadline when the configured one cannot be represented
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Execute one command in a fresh container.
///
/// Returns a report for every run that reached termination, however the
/// process ended. Cancellation requested at any point before the report is
/// built yields [`ExecuteError::Cancelled`] instead.
#[instrument(skip(backend, config, exec, cancel), fields(command = ?exec.command))]
pub async fn execute<B: ContainerBackend>(
    backend: &B,
    config: &Config,
    exec: &ExecutionConfig,
    cancel: CancelSignal,
) -> Result<ExecutionReport, ExecuteError> {
    exec.validate()?;
    if cancel.is_cancelled() {
        return Err(ExecuteError::Cancelled);
    }

    let (uid_mappings, gid_mappings) = id_mappings(exec.user_namespace.as_ref())?;

    let id = next_container_id();
    let base = exec
        .cgroup_path
        .as_deref()
        .unwrap_or(config.cgroup_root.as_path());
    let cgroup = CgroupPaths::resolve(base, exec.user_namespace_enabled(), &id).await?;

    let result = run_container(
        backend,
        config,
        exec,
        &id,
        (uid_mappings, gid_mappings),
        &cgroup,
        cancel,
    )
    .await;

    cgroup.release().await;

    match &result {
        Ok(report) => debug!(
            id,
            status = ?report.status,
            wall_time_ms = report.wall_time_ms,
            exit_code = ?report.exit_code,
            signal = ?report.signal,
            "execution complete"
        ),
        Err(e) => debug!(id, error = %e, kind = ?e.kind(), "execution failed"),
    }

    result
}

async fn run_container<B: ContainerBackend>(
    backend: &B,
    config: &Config,
    exec: &ExecutionConfig,
    id: &str,
    (uid_mappings, gid_mappings): (Vec<IdMapping>, Vec<IdMapping>),
    cgroup: &CgroupPaths,
    cancel: CancelSignal,
) -> Result<ExecutionReport, ExecuteError> {
    let spec = build_container_spec(config, exec, uid_mappings, gid_mappings, cgroup)?;
    let container = backend
        .create(id, &spec)
        .await
        .map_err(ExecuteError::Create)?;
    debug!(id, cgroup = %cgroup.leaf().display(), "container created");

    let result = supervise(&container, config, exec, cgroup.leaf(), cancel).await;

    if let Err(e) = container.destroy().await {
        warn!(id, error = %e, "failed to destroy container");
    }

    result
}

/// Run the process to termination and build its report
async fn supervise<C: Container>(
    container: &C,
    config: &Config,
    exec: &ExecutionConfig,
    cgroup_path: &Path,
    mut cancel: CancelSignal,
) -> Result<ExecutionReport, ExecuteError> {
    let stdio = provision(exec.fd.as_ref()).await?;
    let limits = translate(
        exec.limits
            .as_ref()
            .and_then(|limits| limits.rlimit.as_ref()),
    )?;
    let process = build_process(config, exec, limits.rlimits, stdio.for_process()?);

    let deadline = Duration::from_millis(config.safety_net_ms(exec.time_limit_ms()));

    let start = Instant::now();
    container.run(process).await.map_err(ExecuteError::Launch)?;
    debug!(deadline_ms = deadline.as_millis() as u64, "process started");

    let deadline_at = start
        .checked_add(deadline)
        .unwrap_or_else(|| start + FAR_FUTURE);
    let outcome = race(container, &mut cancel, deadline_at).await;
    let wall_time = start.elapsed();

    if cancel.is_cancelled() {
        return Err(ExecuteError::Cancelled);
    }

    let Outcome {
        state,
        deadline_fired,
    } = outcome?;

    let stats = container.stats().await.map_err(ExecuteError::Stats)?;
    let (stdout_path, stderr_path) = stdio.close();

    let report = report::build(ReportInput {
        exec,
        state,
        stats,
        wall_time,
        wall_time_limit_exceeded: deadline_fired || wall_time >= deadline,
        cgroup_path,
        stdout_path,
        stderr_path,
        fsize_baseline: limits.fsize_baseline,
    })
    .await?;

    Ok(report)
}

struct Outcome {
    state: TerminalState,
    deadline_fired: bool,
}

/// Wait for the process while watching cancellation and the deadline.
///
/// Either watcher kills every process in the container at most once and
/// then keeps waiting; both stop as soon as the wait completes.
async fn race<C: Container>(
    container: &C,
    cancel: &mut CancelSignal,
    deadline: Instant,
) -> Result<Outcome, ExecuteError> {
    let wait = container.wait();
    tokio::pin!(wait);
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    let mut cancel_fired = false;
    let mut deadline_fired = false;

    loop {
        tokio::select! {
            biased;

            result = &mut wait => {
                let state = result.map_err(ExecuteError::Wait)?;
                debug!(?state, "process terminated");
                return Ok(Outcome { state, deadline_fired });
            }

            () = cancel.cancelled(), if !cancel_fired => {
                cancel_fired = true;
                warn!("execution cancelled, killing all processes");
                container
                    .signal(libc::SIGKILL, true)
                    .map_err(ExecuteError::Signal)?;
            }

            () = &mut sleep, if !deadline_fired => {
                deadline_fired = true;
                warn!("safety-net deadline reached, killing all processes");
                container
                    .signal(libc::SIGKILL, true)
                    .map_err(ExecuteError::Signal)?;
            }
        }
    }
}
