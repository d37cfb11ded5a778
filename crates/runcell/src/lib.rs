//! A library for single-shot sandboxed process execution.
//!
//! Runcell takes one command together with its resource limits and
//! isolation settings, runs it in a fresh container, and returns a
//! structured report. The container, its cgroup and every file opened for
//! the run are gone again by the time the report is returned.
//!
//! # Features
//!
//! - **Safety-net deadline** — A hard wall-clock kill at a multiple of the soft time limit.
//! - **Cancellation** — A caller-held handle that kills the run and wins over any other outcome.
//! - **Guaranteed cleanup** — Container and cgroup teardown on every exit path.
//! - **Output limits** — fsize enforcement that tells a real overrun from a stray `SIGXFSZ`.
//! - **Pluggable backends** — Anything implementing [`ContainerBackend`], plus a host backend.
//! - **Judge-ready reports** — Exit code or signal, wall time, CPU, memory and a status verdict.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use container::{Container, ContainerBackend, ContainerError, NativeBackend};
pub use runner::{
    CancelHandle, CancelSignal, ErrorKind, ExecuteError, Runner, cancellation, execute,
};
pub use types::{
    ExecutionConfig, ExecutionLimits, ExecutionReport, ExecutionStatus, FdConfig, ResourceUsage,
    RlimitConfig, RlimitItem, UserNamespaceConfig,
};

pub mod config;
pub mod container;
pub mod runner;
pub mod types;
