//! Lifecycle of one daemon subprocess.
//!
//! `not-started -> starting -> running -> stopping -> stopped`, with `starting` and
//! `running` falling to `crashed` when the process dies on its own. Every
//! transition goes through one async mutex, so concurrent calls are serialized.

pub mod log;
pub mod runtime;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::EffectiveConfig;
use crate::error::{DaemonError, RecoveryError};
use crate::listener::ListenAddr;
use crate::recovery::{RecoveryCoordinator, RecoveryReport, WorkloadManager};
use self::log::LogSink;
use self::runtime::{ExitState, LaunchCommand, ProcessRuntime, StopSignal};

pub const HANDOFF_FILE: &str = "rkd-effective.json";
pub const LOG_FILE: &str = "rkd.log";
const LOG_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::NotStarted => "not-started",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub program: PathBuf,
    /// Holds the configuration handoff and the log.
    pub state_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
}

impl LaunchOptions {
    pub fn new(program: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        LaunchOptions {
            program: program.into(),
            state_dir: state_dir.into(),
            env: Vec::new(),
            start_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
        }
    }

    /// Launches this very binary in daemon mode.
    pub fn for_current_exe(state_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, state_dir))
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// The supervised daemon. Owned by the supervisor for the lifetime of the instance.
struct DaemonProcess {
    pid: Option<u32>,
    endpoints: Vec<ListenAddr>,
    log: Option<LogSink>,
    state: LifecycleState,
    config: Option<EffectiveConfig>,
}

#[derive(Debug)]
pub struct StartOutcome {
    pub pid: u32,
    /// `None` when no workload manager is attached.
    pub recovery: Option<Result<RecoveryReport, RecoveryError>>,
}

struct Recovery {
    coordinator: RecoveryCoordinator,
    manager: Arc<dyn WorkloadManager>,
}

/// Kills the half-started child if the `start` future is dropped mid-way and
/// leaves its pid in `abandoned` for the next locked call to clear.
struct StartGuard {
    runtime: Arc<dyn ProcessRuntime>,
    abandoned: Arc<SyncMutex<Option<u32>>>,
    pid: Option<u32>,
}

impl StartGuard {
    fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            warn!(pid, "start abandoned, killing half-started daemon");
            self.runtime.abandon(pid);
            *self
                .abandoned
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pid);
        }
    }
}

pub struct Supervisor {
    runtime: Arc<dyn ProcessRuntime>,
    options: LaunchOptions,
    recovery: Option<Recovery>,
    process: Mutex<DaemonProcess>,
    abandoned: Arc<SyncMutex<Option<u32>>>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ProcessRuntime>, options: LaunchOptions) -> Self {
        Supervisor {
            runtime,
            options,
            recovery: None,
            process: Mutex::new(DaemonProcess {
                pid: None,
                endpoints: Vec::new(),
                log: None,
                state: LifecycleState::NotStarted,
                config: None,
            }),
            abandoned: Arc::new(SyncMutex::new(None)),
        }
    }

    /// Runs a recovery pass after every transition into `running`.
    pub fn with_recovery(
        mut self,
        coordinator: RecoveryCoordinator,
        manager: Arc<dyn WorkloadManager>,
    ) -> Self {
        self.recovery = Some(Recovery {
            coordinator,
            manager,
        });
        self
    }

    pub async fn start(&self, config: EffectiveConfig) -> Result<StartOutcome, DaemonError> {
        let mut process = self.process.lock().await;
        self.start_locked(&mut process, config).await
    }

    /// Graceful stop, escalating to a forced kill after the grace period.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        let mut process = self.process.lock().await;
        self.stop_locked(&mut process, StopSignal::Graceful).await
    }

    pub async fn kill(&self) -> Result<(), DaemonError> {
        let mut process = self.process.lock().await;
        self.stop_locked(&mut process, StopSignal::Forced).await
    }

    /// Stops the current process (or reaps a crashed one) and starts again with
    /// the configuration of the last `start`.
    pub async fn restart(&self) -> Result<StartOutcome, DaemonError> {
        let mut process = self.process.lock().await;
        let config = process.config.clone().ok_or(DaemonError::NotStarted)?;
        self.stop_locked(&mut process, StopSignal::Graceful).await?;
        self.start_locked(&mut process, config).await
    }

    pub async fn status(&self) -> LifecycleState {
        let mut process = self.process.lock().await;
        self.refresh(&mut process);
        process.state
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut process = self.process.lock().await;
        self.refresh(&mut process);
        match process.state {
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping => {
                process.pid
            }
            _ => None,
        }
    }

    pub async fn log(&self) -> Option<LogSink> {
        self.process.lock().await.log.clone()
    }

    /// Notices a daemon that died on its own or was killed by an abandoned start.
    fn refresh(&self, process: &mut DaemonProcess) {
        let abandoned = self
            .abandoned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pid) = abandoned {
            // the runtime no longer owns this pid, it must never be signalled again
            if process.pid == Some(pid) {
                debug!(pid, "clearing daemon killed by an abandoned start");
                process.pid = None;
                process.state = LifecycleState::Crashed;
            }
        }
        if !matches!(
            process.state,
            LifecycleState::Starting | LifecycleState::Running
        ) {
            return;
        }
        let Some(pid) = process.pid else {
            return;
        };
        if let Some(exit) = self.runtime.exit_state(pid) {
            warn!(pid, ?exit, previous = %process.state, "daemon exited unexpectedly");
            process.state = LifecycleState::Crashed;
        }
    }

    async fn start_locked(
        &self,
        process: &mut DaemonProcess,
        config: EffectiveConfig,
    ) -> Result<StartOutcome, DaemonError> {
        self.refresh(process);
        match process.state {
            LifecycleState::NotStarted | LifecycleState::Stopped => {}
            LifecycleState::Crashed => {
                if let Some(pid) = process.pid.take() {
                    self.runtime.release(pid);
                }
            }
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping => {
                return Err(DaemonError::AlreadyRunning {
                    pidfile: config.pidfile.clone(),
                });
            }
        }

        config.tls.validate()?;
        let endpoints = config.listen_addrs()?;

        tokio::fs::create_dir_all(&self.options.state_dir).await?;
        let handoff = self.options.state_dir.join(HANDOFF_FILE);
        let document = serde_json::to_vec_pretty(&config.to_document())
            .map_err(|e| DaemonError::Other(e.into()))?;
        tokio::fs::write(&handoff, document).await?;
        let log = LogSink::open(self.options.state_dir.join(LOG_FILE))?;

        // An endpoint that already answers belongs to someone else. It cannot
        // prove our child is up; the child's own bind failure decides.
        let mut occupied = Vec::new();
        for endpoint in &endpoints {
            if self
                .runtime
                .answers(endpoint, self.options.poll_interval)
                .await
            {
                debug!(address = %endpoint, "endpoint already answers before spawn");
                occupied.push(endpoint.clone());
            }
        }

        let command = LaunchCommand {
            program: self.options.program.clone(),
            args: vec![
                "daemon".to_string(),
                "--config-file".to_string(),
                handoff.display().to_string(),
            ],
            env: self.options.env.clone(),
            log: log.path().to_path_buf(),
        };
        let pid = self.runtime.spawn(&command).await?;
        info!(pid, endpoints = ?config.listen, "daemon spawned, waiting for it to answer");

        process.pid = Some(pid);
        process.state = LifecycleState::Starting;
        process.endpoints = endpoints;
        process.log = Some(log.clone());
        process.config = Some(config);

        let guard = StartGuard {
            runtime: self.runtime.clone(),
            abandoned: self.abandoned.clone(),
            pid: Some(pid),
        };
        let waited = self.wait_reachable(pid, process, &occupied, &log).await;
        guard.disarm();

        if let Err(e) = waited {
            if self.runtime.exit_state(pid).is_none() {
                if let Err(kill_error) = self.terminate(pid, StopSignal::Forced).await {
                    error!(pid, error = %kill_error, "failed to kill daemon after failed start");
                }
            }
            self.runtime.release(pid);
            process.pid = None;
            process.state = LifecycleState::Crashed;
            return Err(e);
        }

        process.state = LifecycleState::Running;
        info!(pid, "daemon is running");

        let recovery = match &self.recovery {
            Some(recovery) => {
                let result = recovery
                    .coordinator
                    .reconcile(recovery.manager.as_ref())
                    .await;
                match &result {
                    Ok(report) => info!(
                        resumed = report.resumed.len(),
                        paused = report.left_paused.len(),
                        stopped = report.left_stopped.len(),
                        failed = report.failed.len(),
                        "recovery finished"
                    ),
                    Err(e) => warn!(error = %e, "recovery did not run"),
                }
                Some(result)
            }
            None => None,
        };

        Ok(StartOutcome { pid, recovery })
    }

    async fn wait_reachable(
        &self,
        pid: u32,
        process: &DaemonProcess,
        occupied: &[ListenAddr],
        log: &LogSink,
    ) -> Result<(), DaemonError> {
        let deadline = Instant::now() + self.options.start_timeout;
        let config = process.config.as_ref().ok_or(DaemonError::NotStarted)?;

        loop {
            if let Some(exit) = self.runtime.exit_state(pid) {
                let tail = log.tail(LOG_TAIL_LINES);
                warn!(pid, ?exit, "daemon exited during startup");
                return Err(DaemonError::from_daemon_exit(exit.code(), config, tail));
            }

            let mut unreachable = None;
            for endpoint in &process.endpoints {
                if occupied.contains(endpoint)
                    || !self
                        .runtime
                        .answers(endpoint, self.options.poll_interval)
                        .await
                {
                    unreachable = Some(endpoint);
                    break;
                }
            }
            let Some(unreachable) = unreachable else {
                // the child may have lost a race for the address after we checked it
                if self.runtime.exit_state(pid).is_none() {
                    return Ok(());
                }
                continue;
            };

            if Instant::now() >= deadline {
                let tail = log.tail(LOG_TAIL_LINES);
                error!(pid, address = %unreachable, "daemon did not become reachable in time");
                return Err(DaemonError::StartTimeout {
                    address: unreachable.to_string(),
                    timeout: self.options.start_timeout,
                    log_tail: tail,
                });
            }
            sleep(self.options.poll_interval).await;
        }
    }

    async fn stop_locked(
        &self,
        process: &mut DaemonProcess,
        signal: StopSignal,
    ) -> Result<(), DaemonError> {
        self.refresh(process);
        match process.state {
            LifecycleState::NotStarted | LifecycleState::Stopped => Ok(()),
            LifecycleState::Crashed => {
                // already gone, only the bookkeeping is left
                if let Some(pid) = process.pid.take() {
                    self.runtime.release(pid);
                }
                process.state = LifecycleState::Stopped;
                Ok(())
            }
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping => {
                let Some(pid) = process.pid else {
                    process.state = LifecycleState::Stopped;
                    return Ok(());
                };
                process.state = LifecycleState::Stopping;
                let exit = self.terminate(pid, signal).await?;
                info!(pid, ?exit, "daemon stopped");
                self.runtime.release(pid);
                process.pid = None;
                process.state = LifecycleState::Stopped;
                Ok(())
            }
        }
    }

    /// Signals `pid` and waits until it is gone.
    async fn terminate(&self, pid: u32, signal: StopSignal) -> Result<ExitState, DaemonError> {
        if signal == StopSignal::Graceful {
            self.runtime.signal(pid, StopSignal::Graceful)?;
            if let Some(exit) = self.wait_gone(pid, self.options.stop_timeout).await {
                return Ok(exit);
            }
            warn!(
                pid,
                grace = ?self.options.stop_timeout,
                "daemon ignored SIGTERM, killing it"
            );
        }
        self.runtime.signal(pid, StopSignal::Forced)?;
        self.wait_gone(pid, self.options.kill_timeout)
            .await
            .ok_or(DaemonError::StillRunning { pid })
    }

    async fn wait_gone(&self, pid: u32, bound: Duration) -> Option<ExitState> {
        let deadline = Instant::now() + bound;
        loop {
            if let Some(exit) = self.runtime.exit_state(pid) {
                return Some(exit);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}
