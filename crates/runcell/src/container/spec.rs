//! Container and process specifications handed to a backend

use std::path::PathBuf;

use thiserror::Error;

use crate::config::Config;
use crate::container::cgroup::CgroupPaths;
use crate::container::idmap::IdMapping;
use crate::container::rlimit::Rlimit;
use crate::container::stdio::ProcessStdio;
use crate::types::ExecutionConfig;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("working directory must be absolute: {0}")]
    RelativeCwd(PathBuf),

    #[error("search path entry contains ':': {0}")]
    InvalidSearchPath(String),

    #[error("memory limit of {0} KiB overflows")]
    MemoryOverflow(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Pid,
    Ipc,
    Uts,
    Mount,
    Network,
    Cgroup,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Everything a backend needs to create the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub hostname: String,
    pub namespaces: Vec<Namespace>,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// The backend runs with remapped ids and a delegated cgroup
    pub rootless: bool,
    /// Absolute path of the leaf cgroup
    pub cgroup_path: PathBuf,
    pub memory_max_bytes: Option<u64>,
    pub pids_max: Option<u64>,
}

/// The init process of the container
#[derive(Debug)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub user: Identity,
    pub no_new_privileges: bool,
    pub rlimits: Vec<Rlimit>,
    pub stdio: ProcessStdio,
}

/// Assemble the container specification for one run
pub fn build_container_spec(
    config: &Config,
    exec: &ExecutionConfig,
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
    cgroup: &CgroupPaths,
) -> Result<ContainerSpec, SpecError> {
    if !exec.cwd.is_absolute() {
        return Err(SpecError::RelativeCwd(exec.cwd.clone()));
    }
    if let Some(entry) = exec.paths.iter().find(|entry| entry.contains(':')) {
        return Err(SpecError::InvalidSearchPath(entry.clone()));
    }

    let rootless = !uid_mappings.is_empty() || !gid_mappings.is_empty();

    let mut namespaces = vec![
        Namespace::Pid,
        Namespace::Ipc,
        Namespace::Uts,
        Namespace::Mount,
        Namespace::Network,
        Namespace::Cgroup,
    ];
    if rootless {
        namespaces.push(Namespace::User);
    }

    let limits = exec.limits.as_ref();
    let memory_max_bytes = limits
        .and_then(|limits| limits.memory_kib)
        .map(|kib| kib.checked_mul(1024).ok_or(SpecError::MemoryOverflow(kib)))
        .transpose()?;
    let pids_max = limits.and_then(|limits| limits.pids_count);

    Ok(ContainerSpec {
        hostname: config.hostname.clone(),
        namespaces,
        uid_mappings,
        gid_mappings,
        rootless,
        cgroup_path: cgroup.leaf().to_path_buf(),
        memory_max_bytes,
        pids_max,
    })
}

/// Describe the init process: argv, a PATH-only environment, the sandbox
/// identity, no-new-privileges and the translated rlimits.
pub fn build_process(
    config: &Config,
    exec: &ExecutionConfig,
    rlimits: Vec<Rlimit>,
    stdio: ProcessStdio,
) -> ProcessSpec {
    ProcessSpec {
        args: exec.command.clone(),
        env: vec![search_path(&config.system_path, &exec.paths)],
        cwd: exec.cwd.clone(),
        user: Identity {
            uid: config.sandbox_uid,
            gid: config.sandbox_gid,
        },
        no_new_privileges: true,
        rlimits,
        stdio,
    }
}

fn search_path(system_path: &str, extra: &[String]) -> String {
    if extra.is_empty() {
        format!("PATH={system_path}")
    } else {
        format!("PATH={system_path}:{}", extra.join(":"))
    }
}
