use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::listener::{self, ListenAddr};

#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// stdout and stderr of the child are appended here
    pub log: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Code(i32),
    Signaled(i32),
    /// Gone, but not our child, so the status was never observed.
    Unknown,
}

impl ExitState {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitState::Code(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Code(code),
            (None, Some(signal)) => ExitState::Signaled(signal),
            (None, None) => ExitState::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to open log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

/// Process primitives the supervisor is built on.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    async fn spawn(&self, command: &LaunchCommand) -> Result<u32, RuntimeError>;

    /// Signalling a process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), RuntimeError>;

    /// `Some` once the process is gone. Children spawned here are reaped by this call.
    fn exit_state(&self, pid: u32) -> Option<ExitState>;

    async fn answers(&self, endpoint: &ListenAddr, limit: Duration) -> bool;

    /// Kills a child without waiting for it, used when a start is abandoned.
    fn abandon(&self, pid: u32);

    /// Forgets a reaped child.
    fn release(&self, pid: u32);
}

enum Tracked {
    Live(Child),
    Exited(ExitState),
}

/// Runtime over real processes: `tokio::process` children and `nix` signals.
#[derive(Default)]
pub struct NativeRuntime {
    processes: Mutex<HashMap<u32, Tracked>>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessRuntime for NativeRuntime {
    async fn spawn(&self, command: &LaunchCommand) -> Result<u32, RuntimeError> {
        let log_error = |source| RuntimeError::Log {
            path: command.log.clone(),
            source,
        };
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&command.log)
            .map_err(log_error)?;
        let stderr = stdout.try_clone().map_err(log_error)?;

        let spawn_error = |source| RuntimeError::Spawn {
            program: command.program.clone(),
            source,
        };
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(io::Error::other("child exited before its pid was read"))
        })?;

        debug!(pid, program = %command.program.display(), "spawned process");
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pid, Tracked::Live(child));
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), RuntimeError> {
        let signal = match signal {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forced => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(RuntimeError::Signal { pid, source }),
        }
    }

    fn exit_state(&self, pid: u32) -> Option<ExitState> {
        let mut processes = self
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match processes.get_mut(&pid) {
            Some(Tracked::Exited(state)) => Some(*state),
            Some(Tracked::Live(child)) => match child.try_wait() {
                Ok(Some(status)) => {
                    let state = ExitState::from(status);
                    processes.insert(pid, Tracked::Exited(state));
                    Some(state)
                }
                Ok(None) => None,
                Err(e) => {
                    debug!(pid, error = %e, "failed to poll child");
                    None
                }
            },
            // not spawned here: fall back to a liveness check
            None => match kill(Pid::from_raw(pid as i32), None) {
                Err(Errno::ESRCH) => Some(ExitState::Unknown),
                _ => None,
            },
        }
    }

    async fn answers(&self, endpoint: &ListenAddr, limit: Duration) -> bool {
        listener::answers(endpoint, limit).await
    }

    fn abandon(&self, pid: u32) {
        let tracked = self
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid);
        if let Some(Tracked::Live(mut child)) = tracked {
            // tokio reaps dropped children in the background
            let _ = child.start_kill();
        }
    }

    fn release(&self, pid: u32) {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid);
    }
}
