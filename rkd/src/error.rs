use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConflictReport, EffectiveConfig, Provenance};
use crate::supervisor::runtime::RuntimeError;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_MALFORMED_INPUT: i32 = 2;
pub const EXIT_CONFIG_CONFLICT: i32 = 3;
pub const EXIT_ADDRESS_IN_USE: i32 = 4;
pub const EXIT_ALREADY_RUNNING: i32 = 5;
pub const EXIT_START_TIMEOUT: i32 = 6;
pub const EXIT_TLS: i32 = 7;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("malformed {origin} input for `{field}`: {reason}")]
    MalformedInput {
        origin: Provenance,
        field: String,
        reason: String,
    },
    #[error("configuration conflict: {0}")]
    ConfigConflict(ConflictReport),
    #[error("inconsistent TLS configuration on `{field}`: {reason}")]
    InconsistentTls { field: String, reason: String },
    #[error("listen address {address} is already in use")]
    AddressInUse { address: String },
    #[error("another daemon holds the pidfile {}", .pidfile.display())]
    AlreadyRunning { pidfile: PathBuf },
    #[error("daemon was not reachable on {address} within {timeout:?}")]
    StartTimeout {
        address: String,
        timeout: Duration,
        log_tail: String,
    },
    #[error("daemon exited during startup with {}", describe_exit(.code))]
    Exited { code: Option<i32>, log_tail: String },
    #[error("daemon pid {pid} is still alive after a forced kill")]
    StillRunning { pid: u32 },
    #[error("daemon has never been started")]
    NotStarted,
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("bad certificate {}: {reason}", .path.display())]
    BadCertificate { path: PathBuf, reason: String },
    #[error("TLS handshake with {address} failed: {reason}")]
    HandshakeFailed { address: String, reason: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

impl DaemonError {
    /// Process exit code the binary uses for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::MalformedInput { .. } => EXIT_MALFORMED_INPUT,
            DaemonError::ConfigConflict(_) => EXIT_CONFIG_CONFLICT,
            DaemonError::AddressInUse { .. } => EXIT_ADDRESS_IN_USE,
            DaemonError::AlreadyRunning { .. } => EXIT_ALREADY_RUNNING,
            DaemonError::StartTimeout { .. } => EXIT_START_TIMEOUT,
            DaemonError::InconsistentTls { .. }
            | DaemonError::BadCertificate { .. }
            | DaemonError::HandshakeFailed { .. } => EXIT_TLS,
            _ => EXIT_FAILURE,
        }
    }

    /// Rebuilds the error a daemon child reported through its exit code.
    pub fn from_daemon_exit(code: Option<i32>, config: &EffectiveConfig, log_tail: String) -> Self {
        match code {
            Some(EXIT_ADDRESS_IN_USE) => DaemonError::AddressInUse {
                address: busy_address(&log_tail).unwrap_or_else(|| config.listen.join(", ")),
            },
            Some(EXIT_ALREADY_RUNNING) => DaemonError::AlreadyRunning {
                pidfile: config.pidfile.clone(),
            },
            code => DaemonError::Exited { code, log_tail },
        }
    }

    /// Captured daemon output, for errors raised while a child was starting.
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            DaemonError::StartTimeout { log_tail, .. } | DaemonError::Exited { log_tail, .. } => {
                Some(log_tail)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("workload manager reported no workloads within {0:?}")]
    ListTimeout(Duration),
    #[error("recovery incomplete, {} workload(s) not resumed: {}", .0.len(), describe_failures(.0))]
    Incomplete(Vec<WorkloadFailure>),
}

fn describe_failures(failures: &[WorkloadFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.id, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Finds the address named by the child's last "already in use" report.
fn busy_address(log_tail: &str) -> Option<String> {
    log_tail.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("listen address ")?;
        let (address, _) = rest.split_once(" is already in use")?;
        Some(address.to_string())
    })
}
