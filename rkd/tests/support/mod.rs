#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

use common::{WorkloadSnapshot, WorkloadState, WorkloadStatus};
use rkd::config::{DaemonArgs, EffectiveConfig, load};
use rkd::recovery::WorkloadManager;
use rkd::supervisor::runtime::NativeRuntime;
use rkd::supervisor::{LaunchOptions, Supervisor};

pub fn rkd_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rkd"))
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn tcp_listen(port: u16) -> String {
    format!("tcp://127.0.0.1:{port}")
}

/// Daemon flags keeping every path inside `dir`.
pub fn args_in(dir: &Path, listen: &[String]) -> DaemonArgs {
    DaemonArgs {
        config_file: Some(empty_config(dir)),
        listen: listen.to_vec(),
        pidfile: Some(dir.join("rkd.pid").display().to_string()),
        home_dir: Some(dir.join("home").display().to_string()),
        ..Default::default()
    }
}

pub fn config_in(dir: &Path, listen: &[String]) -> EffectiveConfig {
    load(&args_in(dir, listen)).unwrap()
}

/// An explicit empty file keeps a host-wide /etc/rkd/config.json out of the tests.
pub fn empty_config(dir: &Path) -> PathBuf {
    let path = dir.join("empty.json");
    if !path.exists() {
        fs::write(&path, "").unwrap();
    }
    path
}

pub fn launch_options(program: PathBuf, dir: &Path) -> LaunchOptions {
    LaunchOptions::new(program, dir.join("state"))
        .with_start_timeout(Duration::from_secs(10))
        .with_stop_timeout(Duration::from_secs(5))
        .with_env("RUST_LOG", "debug")
}

pub fn supervisor_in(dir: &Path) -> Supervisor {
    Supervisor::new(
        Arc::new(NativeRuntime::new()),
        launch_options(rkd_bin(), dir),
    )
}

/// Writes an executable shell script standing in for the daemon binary.
pub fn fake_daemon(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-daemon");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Whether `pid` is gone or only left as a zombie.
pub fn is_dead(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => true,
    }
}

pub async fn eventually<F>(mut check: F, bound: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + bound;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// In-memory workload manager. Running workloads drop to `exited` when the
/// daemon goes away, like containers losing their shim.
#[derive(Default)]
pub struct FakeWorkloads {
    workloads: Mutex<BTreeMap<String, (WorkloadSnapshot, WorkloadStatus)>>,
    empty_listings: AtomicUsize,
    failing_resumes: Mutex<Vec<String>>,
    stuck: Mutex<Vec<String>>,
    pub resume_calls: AtomicUsize,
}

impl FakeWorkloads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, snapshot: WorkloadSnapshot, status: WorkloadStatus) {
        self.workloads
            .lock()
            .await
            .insert(snapshot.id.clone(), (snapshot, status));
    }

    /// The next `n` listings come back empty.
    pub fn report_empty(&self, n: usize) {
        self.empty_listings.store(n, Ordering::SeqCst);
    }

    pub async fn fail_resume_of(&self, id: &str) {
        self.failing_resumes.lock().await.push(id.to_string());
    }

    /// Resume succeeds but the workload never reaches `running`.
    pub async fn never_runs(&self, id: &str) {
        self.stuck.lock().await.push(id.to_string());
    }

    pub async fn daemon_lost(&self) {
        for (_, status) in self.workloads.lock().await.values_mut() {
            if *status == WorkloadStatus::Running {
                *status = WorkloadStatus::Exited;
            }
        }
    }

    pub async fn status_of(&self, id: &str) -> Option<WorkloadStatus> {
        self.workloads.lock().await.get(id).map(|(_, s)| *s)
    }

    pub async fn statuses(&self) -> BTreeMap<String, WorkloadStatus> {
        self.workloads
            .lock()
            .await
            .iter()
            .map(|(id, (_, s))| (id.clone(), *s))
            .collect()
    }
}

#[async_trait]
impl WorkloadManager for FakeWorkloads {
    async fn list_workloads(&self) -> anyhow::Result<Vec<WorkloadSnapshot>> {
        let pending = self.empty_listings.load(Ordering::SeqCst);
        if pending > 0 {
            self.empty_listings.store(pending - 1, Ordering::SeqCst);
            return Ok(Vec::new());
        }
        Ok(self
            .workloads
            .lock()
            .await
            .values()
            .map(|(snapshot, _)| snapshot.clone())
            .collect())
    }

    async fn resume(&self, id: &str) -> anyhow::Result<()> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_resumes.lock().await.iter().any(|f| f == id) {
            return Err(anyhow!("cannot resume {id}"));
        }
        let stuck = self.stuck.lock().await.iter().any(|s| s == id);
        let mut workloads = self.workloads.lock().await;
        let (_, status) = workloads
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such workload {id}"))?;
        *status = if stuck {
            WorkloadStatus::Restarting
        } else {
            WorkloadStatus::Running
        };
        Ok(())
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<WorkloadState> {
        let workloads = self.workloads.lock().await;
        let (_, status) = workloads
            .get(id)
            .ok_or_else(|| anyhow!("no such workload {id}"))?;
        Ok(WorkloadState {
            status: *status,
            pid: None,
        })
    }
}
