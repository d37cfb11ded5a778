//! In-memory container backend that records every call

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runcell::container::{
    Container, ContainerBackend, ContainerError, ContainerSpec, ProcessSpec, Rlimit, Statistics,
    TerminalState,
};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Run {
        args: Vec<String>,
        env: Vec<String>,
        rlimits: Vec<Rlimit>,
    },
    Wait,
    Signal(i32, bool),
    Stats,
    Destroy,
}

/// How the process terminates
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Exit(i32),
    Signal(i32),
    /// Exit with the code after the delay unless killed first
    ExitAfter(Duration, i32),
    /// Run until killed
    Hang,
    /// Exit with the code after the delay; kills have no effect
    Unkillable(Duration, i32),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub create: bool,
    pub run: bool,
    pub wait: bool,
    pub signal: bool,
    pub stats: bool,
    pub destroy: bool,
}

#[derive(Debug)]
struct Shared {
    behavior: Behavior,
    failures: Failures,
    stdout: Vec<u8>,
    stats: Statistics,
    calls: Mutex<Vec<Call>>,
    specs: Mutex<Vec<ContainerSpec>>,
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn new(behavior: Behavior) -> Self {
        Self::build(behavior, Failures::default(), Vec::new(), Statistics::default())
    }

    pub fn failing(behavior: Behavior, failures: Failures) -> Self {
        Self::build(behavior, failures, Vec::new(), Statistics::default())
    }

    /// The process writes `stdout` before terminating
    pub fn writing(behavior: Behavior, stdout: &[u8]) -> Self {
        Self::build(
            behavior,
            Failures::default(),
            stdout.to_vec(),
            Statistics::default(),
        )
    }

    pub fn with_stats(behavior: Behavior, stats: Statistics) -> Self {
        Self::build(behavior, Failures::default(), Vec::new(), stats)
    }

    fn build(behavior: Behavior, failures: Failures, stdout: Vec<u8>, stats: Statistics) -> Self {
        Self {
            shared: Arc::new(Shared {
                behavior,
                failures,
                stdout,
                stats,
                calls: Mutex::new(Vec::new()),
                specs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.shared.specs.lock().unwrap().clone()
    }

    /// Calls with the Run arguments dropped, for comparing sequences
    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls()
            .iter()
            .map(|call| match call {
                Call::Create(_) => "create",
                Call::Run { .. } => "run",
                Call::Wait => "wait",
                Call::Signal(..) => "signal",
                Call::Stats => "stats",
                Call::Destroy => "destroy",
            })
            .collect()
    }

    pub fn kills(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Signal(libc::SIGKILL, true)))
            .count()
    }
}

fn record(shared: &Shared, call: Call) {
    shared.calls.lock().unwrap().push(call);
}

fn injected(what: &str) -> std::io::Error {
    std::io::Error::other(format!("injected {what} failure"))
}

#[async_trait]
impl ContainerBackend for MockBackend {
    type Container = MockContainer;

    async fn create(
        &self,
        id: &str,
        spec: &ContainerSpec,
    ) -> Result<MockContainer, ContainerError> {
        record(&self.shared, Call::Create(id.to_string()));
        self.shared.specs.lock().unwrap().push(spec.clone());

        if self.shared.failures.create {
            return Err(ContainerError::CreateFailed {
                id: id.to_string(),
                message: "injected create failure".to_string(),
            });
        }

        // Behave like a backend that owns the leaf cgroup
        std::fs::create_dir_all(&spec.cgroup_path)?;

        let (killed, _) = watch::channel(None);
        Ok(MockContainer {
            shared: Arc::clone(&self.shared),
            killed,
        })
    }
}

#[derive(Debug)]
pub struct MockContainer {
    shared: Arc<Shared>,
    killed: watch::Sender<Option<i32>>,
}

impl MockContainer {
    async fn until_killed(&self) -> i32 {
        let mut rx = self.killed.subscribe();
        let signal = *rx
            .wait_for(|signal| signal.is_some())
            .await
            .expect("sender lives as long as the container");
        signal.unwrap_or(libc::SIGKILL)
    }
}

#[async_trait]
impl Container for MockContainer {
    async fn run(&self, mut process: ProcessSpec) -> Result<(), ContainerError> {
        record(
            &self.shared,
            Call::Run {
                args: process.args.clone(),
                env: process.env.clone(),
                rlimits: process.rlimits.clone(),
            },
        );

        if self.shared.failures.run {
            return Err(ContainerError::SpawnFailed(injected("run")));
        }

        if !self.shared.stdout.is_empty() {
            process.stdio.stdout.write_all(&self.shared.stdout)?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<TerminalState, ContainerError> {
        record(&self.shared, Call::Wait);

        if self.shared.failures.wait {
            return Err(ContainerError::Io(injected("wait")));
        }

        let state = match self.shared.behavior {
            Behavior::Exit(code) => TerminalState::Exited(code),
            Behavior::Signal(signal) => TerminalState::Signaled(signal),
            Behavior::ExitAfter(delay, code) => tokio::select! {
                () = tokio::time::sleep(delay) => TerminalState::Exited(code),
                signal = self.until_killed() => TerminalState::Signaled(signal),
            },
            Behavior::Hang => TerminalState::Signaled(self.until_killed().await),
            Behavior::Unkillable(delay, code) => {
                tokio::time::sleep(delay).await;
                TerminalState::Exited(code)
            }
        };
        Ok(state)
    }

    fn signal(&self, signal: i32, all: bool) -> Result<(), ContainerError> {
        record(&self.shared, Call::Signal(signal, all));

        if self.shared.failures.signal {
            return Err(ContainerError::SignalFailed {
                signal,
                source: injected("signal"),
            });
        }

        self.killed.send_replace(Some(signal));
        Ok(())
    }

    async fn stats(&self) -> Result<Statistics, ContainerError> {
        record(&self.shared, Call::Stats);

        if self.shared.failures.stats {
            return Err(ContainerError::StatsFailed {
                path: "cpu.stat".into(),
                message: "injected stats failure".to_string(),
            });
        }
        Ok(self.shared.stats.clone())
    }

    async fn destroy(&self) -> Result<(), ContainerError> {
        record(&self.shared, Call::Destroy);

        if self.shared.failures.destroy {
            return Err(ContainerError::Io(injected("destroy")));
        }
        Ok(())
    }
}
