use std::fs;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serial_test::serial;
use tempfile::tempdir;

use common::{DesiredState, RestartPolicy, WorkloadSnapshot, WorkloadStatus};
use rkd::error::DaemonError;
use rkd::listener::ListenAddr;
use rkd::recovery::RecoveryCoordinator;
use rkd::supervisor::runtime::NativeRuntime;
use rkd::supervisor::{LifecycleState, Supervisor};
use rkd::tls;

mod support;

use support::{
    FakeWorkloads, config_in, eventually, fake_daemon, free_port, is_dead, launch_options,
    supervisor_in, tcp_listen,
};

async fn ping(listen: &str) -> Result<String, DaemonError> {
    let addr = ListenAddr::parse(listen).unwrap();
    tls::ping(&addr, None, Duration::from_secs(2)).await
}

#[tokio::test]
#[serial]
async fn test_start_stop_unix_socket() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("rkd.sock");
    let listen = format!("unix://{}", socket.display());
    let supervisor = supervisor_in(dir.path());

    assert_eq!(supervisor.status().await, LifecycleState::NotStarted);
    let outcome = supervisor
        .start(config_in(dir.path(), &[listen.clone()]))
        .await
        .unwrap();
    assert!(outcome.recovery.is_none());
    assert_eq!(supervisor.status().await, LifecycleState::Running);
    assert_eq!(supervisor.pid().await, Some(outcome.pid));
    assert_eq!(ping(&listen).await.unwrap(), "OK");

    // the handoff is a regular configuration file
    let handoff = dir.path().join("state").join("rkd-effective.json");
    assert!(rkd::config::file::read(&handoff).is_ok());

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.status().await, LifecycleState::Stopped);
    assert_eq!(supervisor.pid().await, None);
    assert!(is_dead(outcome.pid));
    assert!(!socket.exists());
    assert_eq!(fs::read_to_string(dir.path().join("rkd.pid")).unwrap(), "");

    let log = supervisor.log().await.unwrap();
    assert!(log.read().unwrap().contains("daemon stopped"));
}

#[tokio::test]
#[serial]
async fn test_second_instance_on_same_address() {
    let first_dir = tempdir().unwrap();
    let second_dir = tempdir().unwrap();
    let listen = tcp_listen(free_port());

    let first = supervisor_in(first_dir.path());
    first
        .start(config_in(first_dir.path(), &[listen.clone()]))
        .await
        .unwrap();

    let second = supervisor_in(second_dir.path());
    let err = second
        .start(config_in(second_dir.path(), &[listen.clone()]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, DaemonError::AddressInUse { ref address } if address.contains(&listen)),
        "unexpected error: {err}"
    );
    assert_eq!(second.status().await, LifecycleState::Crashed);

    assert_eq!(first.status().await, LifecycleState::Running);
    assert_eq!(ping(&listen).await.unwrap(), "OK");
    first.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_second_instance_with_same_pidfile() {
    let dir = tempdir().unwrap();
    let first_listen = tcp_listen(free_port());
    let second_listen = tcp_listen(free_port());

    let first = supervisor_in(&dir.path().join("first"));
    first
        .start(config_in(dir.path(), &[first_listen.clone()]))
        .await
        .unwrap();

    let second = supervisor_in(&dir.path().join("second"));
    let err = second
        .start(config_in(dir.path(), &[second_listen]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, DaemonError::AlreadyRunning { ref pidfile } if pidfile == &dir.path().join("rkd.pid")),
        "unexpected error: {err}"
    );

    assert_eq!(first.status().await, LifecycleState::Running);
    assert_eq!(ping(&first_listen).await.unwrap(), "OK");
    first.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_stale_pidfile_with_live_pid() {
    let dir = tempdir().unwrap();
    // pid 1 is always alive and never ours
    fs::write(dir.path().join("rkd.pid"), "1\n").unwrap();

    let listen = tcp_listen(free_port());
    let supervisor = supervisor_in(dir.path());
    let outcome = supervisor
        .start(config_in(dir.path(), &[listen]))
        .await
        .unwrap();

    let recorded = fs::read_to_string(dir.path().join("rkd.pid")).unwrap();
    assert_eq!(recorded.trim(), outcome.pid.to_string());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_restart_releases_previous_process() {
    let dir = tempdir().unwrap();
    let listen = tcp_listen(free_port());
    let supervisor = supervisor_in(dir.path());

    let first = supervisor
        .start(config_in(dir.path(), &[listen.clone()]))
        .await
        .unwrap();
    let second = supervisor.restart().await.unwrap();

    assert_ne!(first.pid, second.pid);
    assert!(is_dead(first.pid));
    assert_eq!(supervisor.pid().await, Some(second.pid));
    assert_eq!(ping(&listen).await.unwrap(), "OK");
    supervisor.kill().await.unwrap();
    assert!(is_dead(second.pid));
}

#[tokio::test]
#[serial]
async fn test_start_while_running_is_rejected() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path(), &[tcp_listen(free_port())]);
    let supervisor = supervisor_in(dir.path());
    supervisor.start(config.clone()).await.unwrap();

    let err = supervisor.start(config).await.unwrap_err();
    assert!(matches!(err, DaemonError::AlreadyRunning { .. }));
    assert_eq!(supervisor.status().await, LifecycleState::Running);
    supervisor.stop().await.unwrap();
}

fn recovering_supervisor(dir: &std::path::Path, manager: Arc<FakeWorkloads>) -> Supervisor {
    supervisor_in(dir).with_recovery(
        RecoveryCoordinator::new()
            .with_list_timeout(Duration::from_secs(2), Duration::from_millis(20))
            .with_resume_timeout(Duration::from_secs(2), Duration::from_millis(20)),
        manager,
    )
}

async fn seed(manager: &FakeWorkloads) {
    manager
        .add(
            WorkloadSnapshot::new("web", DesiredState::Running, RestartPolicy::Always),
            WorkloadStatus::Running,
        )
        .await;
    manager
        .add(
            WorkloadSnapshot::new("batch", DesiredState::Paused, RestartPolicy::Always),
            WorkloadStatus::Paused,
        )
        .await;
}

#[tokio::test]
#[serial]
async fn test_restart_recovers_workloads() {
    let dir = tempdir().unwrap();
    let manager = FakeWorkloads::new();
    seed(&manager).await;
    let supervisor = recovering_supervisor(dir.path(), manager.clone());

    supervisor
        .start(config_in(dir.path(), &[tcp_listen(free_port())]))
        .await
        .unwrap();

    manager.daemon_lost().await;
    manager.report_empty(3);
    let outcome = supervisor.restart().await.unwrap();

    let report = outcome.recovery.unwrap().unwrap();
    assert_eq!(report.resumed, vec!["web"]);
    assert_eq!(report.left_paused, vec!["batch"]);
    assert_eq!(manager.status_of("web").await, Some(WorkloadStatus::Running));
    assert_eq!(manager.status_of("batch").await, Some(WorkloadStatus::Paused));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_out_of_band_kill_converges_like_restart() {
    // planned restart
    let planned_dir = tempdir().unwrap();
    let planned = FakeWorkloads::new();
    seed(&planned).await;
    let supervisor = recovering_supervisor(planned_dir.path(), planned.clone());
    supervisor
        .start(config_in(planned_dir.path(), &[tcp_listen(free_port())]))
        .await
        .unwrap();
    planned.daemon_lost().await;
    let planned_report = supervisor.restart().await.unwrap().recovery.unwrap().unwrap();
    supervisor.stop().await.unwrap();

    // crash
    let crashed_dir = tempdir().unwrap();
    let crashed = FakeWorkloads::new();
    seed(&crashed).await;
    let listen = tcp_listen(free_port());
    let supervisor = recovering_supervisor(crashed_dir.path(), crashed.clone());
    let outcome = supervisor
        .start(config_in(crashed_dir.path(), &[listen.clone()]))
        .await
        .unwrap();

    kill(Pid::from_raw(outcome.pid as i32), Signal::SIGKILL).unwrap();
    crashed.daemon_lost().await;
    let mut crashed_state = LifecycleState::Running;
    for _ in 0..100 {
        crashed_state = supervisor.status().await;
        if crashed_state == LifecycleState::Crashed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(crashed_state, LifecycleState::Crashed);

    let crash_report = supervisor.restart().await.unwrap().recovery.unwrap().unwrap();
    assert_eq!(supervisor.status().await, LifecycleState::Running);
    assert_eq!(ping(&listen).await.unwrap(), "OK");
    supervisor.stop().await.unwrap();

    assert_eq!(planned_report, crash_report);
    assert_eq!(planned.statuses().await, crashed.statuses().await);
}

#[tokio::test]
#[serial]
async fn test_unreachable_daemon_times_out() {
    let dir = tempdir().unwrap();
    let program = fake_daemon(dir.path(), "echo booting slowly\nexec sleep 30");
    let options = launch_options(program, dir.path()).with_start_timeout(Duration::from_secs(1));
    let supervisor = Supervisor::new(Arc::new(NativeRuntime::new()), options);

    let err = supervisor
        .start(config_in(dir.path(), &[tcp_listen(free_port())]))
        .await
        .unwrap_err();
    match &err {
        DaemonError::StartTimeout { log_tail, .. } => {
            assert!(log_tail.contains("booting slowly"))
        }
        other => panic!("expected StartTimeout, got {other}"),
    }
    assert_eq!(err.exit_code(), rkd::error::EXIT_START_TIMEOUT);
    assert_eq!(supervisor.status().await, LifecycleState::Crashed);
    assert_eq!(supervisor.pid().await, None);

    // restart works from crashed
    let err = supervisor.restart().await.unwrap_err();
    assert!(matches!(err, DaemonError::StartTimeout { .. }));
}

#[tokio::test]
#[serial]
async fn test_early_exit_is_mapped_from_exit_code() {
    let dir = tempdir().unwrap();
    let program = fake_daemon(dir.path(), "echo cannot bind >&2\nexit 4");
    let supervisor = Supervisor::new(
        Arc::new(NativeRuntime::new()),
        launch_options(program, dir.path()),
    );
    let listen = tcp_listen(free_port());
    let err = supervisor
        .start(config_in(dir.path(), &[listen.clone()]))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::AddressInUse { ref address } if address == &listen));

    let busy = tcp_listen(free_port());
    let program = fake_daemon(
        dir.path(),
        &format!("echo \"rkd: listen address {busy} is already in use\" >&2\nexit 4"),
    );
    let supervisor = Supervisor::new(
        Arc::new(NativeRuntime::new()),
        launch_options(program, dir.path()),
    );
    let err = supervisor
        .start(config_in(dir.path(), &[listen.clone(), busy.clone()]))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::AddressInUse { ref address } if address == &busy));

    let program = fake_daemon(dir.path(), "echo broken config >&2\nexit 1");
    let supervisor = Supervisor::new(
        Arc::new(NativeRuntime::new()),
        launch_options(program, dir.path()),
    );
    let err = supervisor
        .start(config_in(dir.path(), &[listen]))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Exited { code: Some(1), ref log_tail } if log_tail.contains("broken config")));
}

#[tokio::test]
#[serial]
async fn test_inconsistent_tls_fails_before_spawn() {
    let dir = tempdir().unwrap();
    let mut args = support::args_in(dir.path(), &[tcp_listen(free_port())]);
    args.tlscert = Some("/nonexistent/cert.pem".into());
    let config = rkd::config::load(&args).unwrap();

    let supervisor = supervisor_in(dir.path());
    let err = supervisor.start(config).await.unwrap_err();
    assert!(matches!(err, DaemonError::InconsistentTls { .. }));
    assert_eq!(supervisor.status().await, LifecycleState::NotStarted);
    assert!(!dir.path().join("state").join("rkd.log").exists());
}

#[tokio::test]
#[serial]
async fn test_abandoned_start_kills_child_and_frees_the_slot() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("child.pid");
    let program = fake_daemon(
        dir.path(),
        &format!("echo $$ > {}\nexec sleep 30", marker.display()),
    );
    let options = launch_options(program, dir.path()).with_start_timeout(Duration::from_secs(1));
    let supervisor = Supervisor::new(Arc::new(NativeRuntime::new()), options);
    let config = config_in(dir.path(), &[tcp_listen(free_port())]);

    let start = supervisor.start(config.clone());
    assert!(
        tokio::time::timeout(Duration::from_millis(500), start)
            .await
            .is_err()
    );
    let pid: u32 = fs::read_to_string(&marker).unwrap().trim().parse().unwrap();

    // the abandoned child is accounted for before anything else runs
    assert_eq!(supervisor.status().await, LifecycleState::Crashed);
    assert_eq!(supervisor.pid().await, None);

    // and a new start goes ahead instead of reporting a phantom instance
    let err = supervisor.start(config).await.unwrap_err();
    assert!(
        matches!(err, DaemonError::StartTimeout { .. }),
        "unexpected error: {err}"
    );
    assert!(eventually(|| is_dead(pid), Duration::from_secs(5)).await);
}

#[tokio::test]
#[serial]
async fn test_stop_escalates_when_sigterm_is_ignored() {
    let dir = tempdir().unwrap();
    let program = fake_daemon(dir.path(), "trap '' TERM\nwhile :; do sleep 1; done");
    let grace = Duration::from_millis(500);
    let options = launch_options(program, dir.path()).with_stop_timeout(grace);
    let supervisor = Supervisor::new(Arc::new(NativeRuntime::new()), options);

    // the script cannot listen, so the endpoint comes up from here once it runs
    let port = free_port();
    let config = config_in(dir.path(), &[tcp_listen(port)]);
    let (outcome, _endpoint) = tokio::join!(supervisor.start(config), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap()
    });
    let pid = outcome.unwrap().pid;

    let began = std::time::Instant::now();
    supervisor.stop().await.unwrap();
    assert!(began.elapsed() >= grace);
    assert!(is_dead(pid));
    assert_eq!(supervisor.status().await, LifecycleState::Stopped);
}
