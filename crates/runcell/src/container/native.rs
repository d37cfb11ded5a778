//! Host process backend
//!
//! Runs the init process directly on the host in its own process group,
//! confined to the run's cgroup when the cgroup hierarchy is writable.
//! Namespaces beyond ipc/uts/net and user-namespace remapping are not
//! realized here.

use std::ffi::CString;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::container::cgroup::remove_path;
use crate::container::spec::{ContainerSpec, ProcessSpec};
use crate::container::{Container, ContainerBackend, ContainerError, Statistics, TerminalState};

/// Backend that spawns the process on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerBackend for NativeBackend {
    type Container = NativeContainer;

    #[instrument(skip(self, spec), fields(cgroup = %spec.cgroup_path.display()))]
    async fn create(
        &self,
        id: &str,
        spec: &ContainerSpec,
    ) -> Result<NativeContainer, ContainerError> {
        if !spec.uid_mappings.is_empty() || !spec.gid_mappings.is_empty() {
            return Err(ContainerError::Unsupported(
                "user namespace remapping".to_string(),
            ));
        }

        let create_failed = |e: std::io::Error| ContainerError::CreateFailed {
            id: id.to_string(),
            message: e.to_string(),
        };

        let cgroup = match prepare_cgroup(&spec.cgroup_path).await {
            Ok(true) => {
                apply_limits(spec).await.map_err(create_failed)?;
                Some(spec.cgroup_path.clone())
            }
            Ok(false) => None,
            Err(e) if degradable(&e) => {
                warn!(error = %e, "no cgroup access, running without resource accounting");
                None
            }
            Err(e) => return Err(create_failed(e)),
        };

        debug!(id, has_cgroup = cgroup.is_some(), "container created");

        Ok(NativeContainer {
            id: id.to_string(),
            hostname: spec.hostname.clone(),
            cgroup,
            child: Mutex::new(None),
            pid: OnceLock::new(),
            reaped: AtomicBool::new(false),
        })
    }
}

fn degradable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem | ErrorKind::NotFound
    )
}

/// Create the leaf cgroup.
///
/// Returns `false` when the leaf turned out not to be on cgroupfs.
async fn prepare_cgroup(leaf: &Path) -> std::io::Result<bool> {
    tokio::fs::create_dir_all(leaf).await?;

    if !leaf.join("cgroup.procs").exists() {
        warn!(path = %leaf.display(), "not a cgroup, running without resource accounting");
        remove_path(leaf).await?;
        return Ok(false);
    }

    if let Some(base) = leaf.parent()
        && let Err(e) = write_control(base, "cgroup.subtree_control", "+cpu +memory +pids").await
    {
        debug!(path = %base.display(), error = %e, "controllers not delegated");
    }

    Ok(true)
}

/// Write the requested limits into a leaf known to be on cgroupfs.
/// A limit that cannot be written is an error, never a silent downgrade.
async fn apply_limits(spec: &ContainerSpec) -> std::io::Result<()> {
    let leaf = &spec.cgroup_path;

    if let Some(bytes) = spec.memory_max_bytes {
        write_control(leaf, "memory.max", &bytes.to_string()).await?;
        // Keep the limit exact; swapping would hide OOM kills
        if let Err(e) = write_control(leaf, "memory.swap.max", "0").await {
            debug!(error = %e, "memory.swap.max not set");
        }
    }
    if let Some(pids) = spec.pids_max {
        write_control(leaf, "pids.max", &pids.to_string()).await?;
    }

    Ok(())
}

async fn write_control(cgroup: &Path, file: &str, value: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut handle = tokio::fs::OpenOptions::new()
        .write(true)
        .open(cgroup.join(file))
        .await?;
    handle.write_all(value.as_bytes()).await
}

/// A process tree started by [`NativeBackend`]
#[derive(Debug)]
pub struct NativeContainer {
    id: String,
    hostname: String,
    cgroup: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    pid: OnceLock<i32>,
    reaped: AtomicBool,
}

impl NativeContainer {
    /// The leaf cgroup, when the process is confined to one
    pub fn cgroup(&self) -> Option<&Path> {
        self.cgroup.as_deref()
    }

    fn command(&self, process: ProcessSpec) -> Result<Command, ContainerError> {
        let (program, args) = process
            .args
            .split_first()
            .ok_or_else(|| ContainerError::SpawnFailed(ErrorKind::InvalidInput.into()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(process.env.iter().filter_map(|entry| entry.split_once('=')))
            .current_dir(&process.cwd)
            .stdin(Stdio::from(process.stdio.stdin))
            .stdout(Stdio::from(process.stdio.stdout))
            .stderr(Stdio::from(process.stdio.stderr))
            .process_group(0)
            .kill_on_drop(true);

        let setup = ChildSetup {
            cgroup_procs: self
                .cgroup
                .as_ref()
                .map(|cgroup| c_path(&cgroup.join("cgroup.procs")))
                .transpose()?,
            hostname: CString::new(self.hostname.as_str()).map_err(std::io::Error::other)?,
            rlimits: process
                .rlimits
                .iter()
                .map(|limit| {
                    (
                        limit.resource.as_raw(),
                        libc::rlimit {
                            rlim_cur: limit.soft,
                            rlim_max: limit.hard,
                        },
                    )
                })
                .collect(),
            no_new_privileges: process.no_new_privileges,
            // Only root can unshare and switch identity without a user namespace
            identity: is_root().then_some((process.user.uid, process.user.gid)),
        };

        // SAFETY: the closure only performs async-signal-safe syscalls on
        // data prepared before fork.
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        Ok(command)
    }
}

#[async_trait]
impl Container for NativeContainer {
    #[instrument(skip(self, process), fields(id = %self.id))]
    async fn run(&self, process: ProcessSpec) -> Result<(), ContainerError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(ContainerError::AlreadyStarted);
        }

        debug!(args = ?process.args, cwd = %process.cwd.display(), "starting process");

        let child = self
            .command(process)?
            .spawn()
            .map_err(ContainerError::SpawnFailed)?;

        let pid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or(ContainerError::NotStarted)?;
        let _ = self.pid.set(pid);
        *slot = Some(child);

        debug!(pid, "process started");
        Ok(())
    }

    async fn wait(&self) -> Result<TerminalState, ContainerError> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut().ok_or(ContainerError::NotStarted)?;

        let status = child.wait().await?;
        self.reaped.store(true, Ordering::SeqCst);

        let state = TerminalState::from(status);
        debug!(?state, "process terminated");
        Ok(state)
    }

    fn signal(&self, signal: i32, all: bool) -> Result<(), ContainerError> {
        let pid = *self.pid.get().ok_or(ContainerError::NotStarted)?;
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }

        // The process leads its own group, so -pid reaches every descendant
        // that has not moved to another group. The init process itself may
        // have left the group and is always signalled directly.
        if all {
            send(-pid, signal)?;
        }
        send(pid, signal)?;

        if all
            && signal == libc::SIGKILL
            && let Some(cgroup) = &self.cgroup
        {
            kill_cgroup(cgroup);
        }

        Ok(())
    }

    async fn stats(&self) -> Result<Statistics, ContainerError> {
        let Some(cgroup) = &self.cgroup else {
            return Ok(Statistics::default());
        };

        let mut stats = Statistics::default();

        if let Some(content) = read_control(cgroup, "cpu.stat").await? {
            stats.cpu_usage_usec = parse_keyed(&content, "usage_usec")
                .map_err(|message| stats_error(cgroup, "cpu.stat", message))?;
            stats.cpu_user_usec = parse_keyed(&content, "user_usec")
                .map_err(|message| stats_error(cgroup, "cpu.stat", message))?;
            stats.cpu_system_usec = parse_keyed(&content, "system_usec")
                .map_err(|message| stats_error(cgroup, "cpu.stat", message))?;
        }

        if let Some(content) = read_control(cgroup, "memory.peak").await? {
            let peak = content.trim();
            stats.memory_peak_bytes = Some(peak.parse().map_err(|_| {
                stats_error(cgroup, "memory.peak", format!("invalid value {peak:?}"))
            })?);
        }

        if let Some(content) = read_control(cgroup, "memory.events").await? {
            stats.oom_kill_count = parse_keyed(&content, "oom_kill")
                .map_err(|message| stats_error(cgroup, "memory.events", message))?;
        }

        Ok(stats)
    }

    #[instrument(skip(self), fields(id = %self.id))]
    async fn destroy(&self) -> Result<(), ContainerError> {
        if self.pid.get().is_some() && !self.reaped.load(Ordering::SeqCst) {
            self.signal(libc::SIGKILL, true)?;
            let mut slot = self.child.lock().await;
            if let Some(child) = slot.as_mut() {
                child.wait().await?;
                self.reaped.store(true, Ordering::SeqCst);
            }
        }

        if let Some(cgroup) = &self.cgroup {
            kill_cgroup(cgroup);
            remove_path(cgroup).await?;
        }

        debug!("container destroyed");
        Ok(())
    }
}

impl Drop for NativeContainer {
    fn drop(&mut self) {
        let Some(&pid) = self.pid.get() else {
            return;
        };
        if self.reaped.load(Ordering::SeqCst) {
            return;
        }

        warn!(id = %self.id, pid, "container dropped while running, killing processes");
        let _ = send(-pid, libc::SIGKILL);
        let _ = send(pid, libc::SIGKILL);
        if let Some(cgroup) = &self.cgroup {
            kill_cgroup(cgroup);
        }
    }
}

/// kill(2), treating a target that is already gone as success
fn send(target: i32, signal: i32) -> Result<(), ContainerError> {
    // SAFETY: kill(2) has no memory-safety preconditions
    if unsafe { libc::kill(target, signal) } == 0 {
        return Ok(());
    }

    let source = std::io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(ContainerError::SignalFailed { signal, source })
    }
}

/// Everything the forked child needs before exec, prepared up front
struct ChildSetup {
    cgroup_procs: Option<CString>,
    hostname: CString,
    rlimits: Vec<(libc::__rlimit_resource_t, libc::rlimit)>,
    no_new_privileges: bool,
    identity: Option<(u32, u32)>,
}

impl ChildSetup {
    fn apply(&self) -> std::io::Result<()> {
        if let Some(path) = &self.cgroup_procs {
            join_cgroup(path)?;
        }

        if self.identity.is_some() {
            let flags = libc::CLONE_NEWIPC | libc::CLONE_NEWUTS | libc::CLONE_NEWNET;
            check(unsafe { libc::unshare(flags) })?;
            check(unsafe {
                libc::sethostname(self.hostname.as_ptr(), self.hostname.as_bytes().len())
            })?;
        }

        for (resource, limit) in &self.rlimits {
            check(unsafe { libc::setrlimit(*resource, limit) })?;
        }

        if let Some((uid, gid)) = self.identity {
            check(unsafe { libc::setgroups(0, std::ptr::null()) })?;
            check(unsafe { libc::setgid(gid) })?;
            check(unsafe { libc::setuid(uid) })?;
        }

        if self.no_new_privileges {
            check(unsafe { libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            ) })?;
        }

        Ok(())
    }
}

/// Move the calling process into the cgroup
fn join_cgroup(procs: &CString) -> std::io::Result<()> {
    let fd = unsafe { libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    check(fd)?;
    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
    let result = if written < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    result
}

fn check(ret: libc::c_int) -> std::io::Result<()> {
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid(2) cannot fail
    unsafe { libc::geteuid() == 0 }
}

fn c_path(path: &Path) -> Result<CString, ContainerError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| ContainerError::Io(std::io::Error::other(e)))
}

/// Kill everything in the cgroup. Kernels without cgroup.kill are ignored.
fn kill_cgroup(cgroup: &Path) {
    use std::io::Write;

    let result = std::fs::OpenOptions::new()
        .write(true)
        .open(cgroup.join("cgroup.kill"))
        .and_then(|mut file| file.write_all(b"1"));

    match result {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %cgroup.display(), error = %e, "failed to write cgroup.kill"),
    }
}

async fn read_control(cgroup: &Path, file: &str) -> Result<Option<String>, ContainerError> {
    match tokio::fs::read_to_string(cgroup.join(file)).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(stats_error(cgroup, file, e.to_string())),
    }
}

fn stats_error(cgroup: &Path, file: &str, message: String) -> ContainerError {
    ContainerError::StatsFailed {
        path: cgroup.join(file),
        message,
    }
}

/// Look up `key` in a flat-keyed cgroup file such as cpu.stat
fn parse_keyed(content: &str, key: &str) -> Result<Option<u64>, String> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some(key) {
            continue;
        }

        let value = parts
            .next()
            .ok_or_else(|| format!("missing value for {key}"))?;
        return value
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid value {value:?} for {key}"));
    }

    Ok(None)
}
