use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state a workload was last asked to be in.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Paused,
    Stopped,
}

/// Per-workload rule deciding whether it comes back after the daemon restarts.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    OnFailure,
}

/// What the workload manager currently observes for a workload.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    #[serde(other)]
    Unknown,
}

/// Read-only view of a workload as reported by the workload manager after a restart.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "desiredState")]
    pub desired: DesiredState,
    #[serde(rename = "restartPolicy", default)]
    pub restart_policy: RestartPolicy,
    // None when the workload never exited or vanished without a recorded status
    #[serde(rename = "lastExitCode", default)]
    pub last_exit_code: Option<i32>,
    #[serde(rename = "finishedAt", default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Reply of an inspect call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkloadState {
    pub status: WorkloadStatus,
    #[serde(default)]
    pub pid: Option<i32>,
}

impl WorkloadSnapshot {
    pub fn new(id: impl Into<String>, desired: DesiredState, restart_policy: RestartPolicy) -> Self {
        let id = id.into();
        WorkloadSnapshot {
            name: id.clone(),
            id,
            desired,
            restart_policy,
            last_exit_code: None,
            finished_at: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.last_exit_code = Some(code);
        self
    }

    /// Whether the last run ended abnormally. A workload whose process vanished
    /// without a recorded exit code counts as failed.
    pub fn exited_with_failure(&self) -> bool {
        self.last_exit_code.is_none_or(|code| code != 0)
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DesiredState::Running => "running",
            DesiredState::Paused => "paused",
            DesiredState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartPolicy::Never => "never",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
        };
        f.write_str(s)
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadStatus::Created => "created",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Paused => "paused",
            WorkloadStatus::Restarting => "restarting",
            WorkloadStatus::Exited => "exited",
            WorkloadStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
