//! Bringing workloads back after the daemon (re)starts.
//!
//! The coordinator compares what each workload was asked to be (desired state and
//! restart policy) with what the workload manager reports, and only ever resumes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use common::{DesiredState, RestartPolicy, WorkloadSnapshot, WorkloadState, WorkloadStatus};

use crate::error::{RecoveryError, WorkloadFailure};

/// The workload manager as seen from the supervisor. Calls are idempotent and
/// must be safe when no workloads exist.
#[async_trait]
pub trait WorkloadManager: Send + Sync {
    async fn list_workloads(&self) -> anyhow::Result<Vec<WorkloadSnapshot>>;

    async fn resume(&self, id: &str) -> anyhow::Result<()>;

    async fn inspect(&self, id: &str) -> anyhow::Result<WorkloadState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Resume,
    LeavePaused,
    LeaveStopped,
}

/// What recovery does with one workload.
pub fn plan(snapshot: &WorkloadSnapshot) -> RecoveryAction {
    match (snapshot.desired, snapshot.restart_policy) {
        (DesiredState::Paused, _) => RecoveryAction::LeavePaused,
        (DesiredState::Stopped, _) | (_, RestartPolicy::Never) => RecoveryAction::LeaveStopped,
        (DesiredState::Running, RestartPolicy::Always) => RecoveryAction::Resume,
        (DesiredState::Running, RestartPolicy::OnFailure) => {
            if snapshot.exited_with_failure() {
                RecoveryAction::Resume
            } else {
                RecoveryAction::LeaveStopped
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: Vec<String>,
    pub left_paused: Vec<String>,
    pub left_stopped: Vec<String>,
    pub failed: Vec<WorkloadFailure>,
}

impl RecoveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The per-workload failures as an error, if there were any.
    pub fn incomplete(&self) -> Option<RecoveryError> {
        (!self.failed.is_empty()).then(|| RecoveryError::Incomplete(self.failed.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    list_timeout: Duration,
    list_interval: Duration,
    resume_timeout: Duration,
    inspect_interval: Duration,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        RecoveryCoordinator {
            list_timeout: Duration::from_secs(10),
            list_interval: Duration::from_millis(200),
            resume_timeout: Duration::from_secs(10),
            inspect_interval: Duration::from_millis(200),
        }
    }
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list_timeout(mut self, timeout: Duration, interval: Duration) -> Self {
        self.list_timeout = timeout;
        self.list_interval = interval;
        self
    }

    pub fn with_resume_timeout(mut self, timeout: Duration, interval: Duration) -> Self {
        self.resume_timeout = timeout;
        self.inspect_interval = interval;
        self
    }

    /// Runs one recovery pass. Per-workload failures are collected in the report;
    /// only an empty listing that never fills up is an error.
    pub async fn reconcile(
        &self,
        manager: &dyn WorkloadManager,
    ) -> Result<RecoveryReport, RecoveryError> {
        let workloads = self.list_settled(manager).await?;
        let mut report = RecoveryReport::default();

        for workload in workloads {
            let id = workload.id.clone();
            match plan(&workload) {
                RecoveryAction::LeavePaused => {
                    debug!(workload = %id, "leaving paused workload untouched");
                    report.left_paused.push(id);
                }
                RecoveryAction::LeaveStopped => {
                    debug!(
                        workload = %id,
                        desired = %workload.desired,
                        policy = %workload.restart_policy,
                        "workload stays stopped"
                    );
                    report.left_stopped.push(id);
                }
                RecoveryAction::Resume => match self.resume_one(manager, &id).await {
                    Ok(()) => {
                        info!(workload = %id, "workload resumed");
                        report.resumed.push(id);
                    }
                    Err(reason) => {
                        warn!(workload = %id, %reason, "failed to resume workload");
                        report.failed.push(WorkloadFailure { id, reason });
                    }
                },
            }
        }

        if let Some(incomplete) = report.incomplete() {
            warn!("{incomplete}");
        }
        Ok(report)
    }

    /// Lists workloads, retrying while the manager is still catching up.
    async fn list_settled(
        &self,
        manager: &dyn WorkloadManager,
    ) -> Result<Vec<WorkloadSnapshot>, RecoveryError> {
        let deadline = Instant::now() + self.list_timeout;
        loop {
            match manager.list_workloads().await {
                Ok(workloads) if !workloads.is_empty() => return Ok(workloads),
                Ok(_) => debug!("workload manager reports no workloads yet"),
                Err(e) => debug!(error = %e, "listing workloads failed, retrying"),
            }
            if Instant::now() >= deadline {
                return Err(RecoveryError::ListTimeout(self.list_timeout));
            }
            sleep(self.list_interval).await;
        }
    }

    async fn resume_one(&self, manager: &dyn WorkloadManager, id: &str) -> Result<(), String> {
        let deadline = Instant::now() + self.resume_timeout;

        // A workload whose process is already gone is resumed like any other.
        while let Err(e) = manager.resume(id).await {
            if Instant::now() >= deadline {
                return Err(format!("resume failed: {e:#}"));
            }
            debug!(workload = %id, error = %e, "resume failed, retrying");
            sleep(self.inspect_interval).await;
        }

        let mut last_seen = None;
        loop {
            match manager.inspect(id).await {
                Ok(state) if state.status == WorkloadStatus::Running => return Ok(()),
                Ok(state) => last_seen = Some(state.status),
                Err(e) => debug!(workload = %id, error = %e, "inspect failed"),
            }
            if Instant::now() >= deadline {
                return Err(match last_seen {
                    Some(status) => format!(
                        "still {status} {:?} after resume",
                        self.resume_timeout
                    ),
                    None => format!("not observed within {:?} after resume", self.resume_timeout),
                });
            }
            sleep(self.inspect_interval).await;
        }
    }
}
