use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use warden::config::{validate, Args, ProcessConfig, ProcessSpec, Size, ValidationContext};
use warden::error::WardenError;
use warden::process::{Failure, Supervisor, SupervisorConfig, UnitPhase};

const WAIT: Duration = Duration::from_secs(10);

fn create_test_spec(
    dir: &Path,
    name: &str,
    script: &str,
    args: &[&str],
    tweak: impl FnOnce(&mut ProcessConfig),
) -> ProcessSpec {
    let mut record = ProcessConfig::new(name, script);
    record.args = Args::List(args.iter().map(|s| s.to_string()).collect());
    tweak(&mut record);

    let ctx = ValidationContext {
        base_dir: dir.to_path_buf(),
        log_dir: dir.join("logs"),
    };
    validate(&[record], &ctx).unwrap().remove(0)
}

fn sleeper(dir: &Path, name: &str) -> ProcessSpec {
    create_test_spec(dir, name, "/bin/sleep", &["30"], |_| {})
}

/// Zombies count as gone; nothing in a test container may reap orphans
fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(false, |(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

async fn read_pid(path: &Path) -> u32 {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Ok(pid) = std::fs::read_to_string(path).unwrap_or_default().trim().parse() {
            return pid;
        }
        assert!(tokio::time::Instant::now() < deadline, "pid file never written");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_start_and_stop() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor.add(sleeper(temp_dir.path(), "web")).unwrap();

    assert_eq!(supervisor.status("web").unwrap().phase, UnitPhase::Stopped);

    supervisor.start("web").unwrap();
    let status = supervisor.settle("web", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Running);
    let pid = status.pid.unwrap();
    assert!(is_alive(pid));

    supervisor.stop("web", None).unwrap();
    let status = supervisor.settle("web", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Stopped);
    assert_eq!(status.pid, None);
    assert!(status.last_failure.is_none());
    assert!(!is_alive(pid));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_unknown_units() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor.add(sleeper(temp_dir.path(), "web")).unwrap();

    let result = supervisor.add(sleeper(temp_dir.path(), "web"));
    assert!(matches!(result, Err(WardenError::UnitAlreadyExists(_))));

    assert!(matches!(
        supervisor.start("ghost"),
        Err(WardenError::UnitNotFound(_))
    ));
    assert!(matches!(
        supervisor.remove("ghost").await,
        Err(WardenError::UnitNotFound(_))
    ));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_marks_failed() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "missing",
            "/nonexistent/warden-test-binary",
            &[],
            |_| {},
        ))
        .unwrap();

    supervisor.start("missing").unwrap();
    let status = supervisor.settle("missing", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Failed);
    assert!(matches!(status.last_failure, Some(Failure::Spawn(_))));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crashing_unit_is_restarted() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "flaky",
            "/bin/sh",
            &["-c", "sleep 0.2; exit 1"],
            |c| {
                c.restart_delay = 100;
                c.max_restart_delay = 200;
            },
        ))
        .unwrap();

    supervisor.start("flaky").unwrap();
    let status = supervisor
        .wait_for("flaky", WAIT, |s| s.restarts >= 2)
        .await
        .unwrap();
    assert!(status.recent_exits >= 2);
    assert_eq!(status.last_exit.and_then(|e| e.code), Some(1));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_restart_budget() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "doomed",
            "/bin/sh",
            &["-c", "exit 1"],
            |c| {
                c.restart_delay = 0;
                c.max_restarts = 2;
            },
        ))
        .unwrap();

    supervisor.start("doomed").unwrap();
    let status = supervisor
        .wait_for("doomed", WAIT, |s| s.phase == UnitPhase::Failed)
        .await
        .unwrap();

    assert_eq!(status.restarts, 2);
    assert_eq!(status.recent_exits, 3);
    assert!(matches!(
        status.last_failure,
        Some(Failure::RestartBudgetExhausted { exits: 3, .. })
    ));

    // A failed unit can be started again with a fresh budget
    supervisor.start("doomed").unwrap();
    let status = supervisor
        .wait_for("doomed", WAIT, |s| {
            s.phase == UnitPhase::Failed && s.restarts == 4
        })
        .await
        .unwrap();
    assert_eq!(status.recent_exits, 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_exit_code_is_not_a_crash() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "oneshot",
            "/bin/sh",
            &["-c", "exit 3"],
            |c| c.stop_exit_codes = vec![3],
        ))
        .unwrap();

    supervisor.start("oneshot").unwrap();
    let status = supervisor
        .wait_for("oneshot", WAIT, |s| {
            s.phase == UnitPhase::Stopped && s.last_exit.is_some()
        })
        .await
        .unwrap();

    assert_eq!(status.restarts, 0);
    assert!(status.last_failure.is_none());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_autorestart_disabled_stays_down() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "once",
            "/bin/sh",
            &["-c", "exit 2"],
            |c| c.autorestart = false,
        ))
        .unwrap();

    supervisor.start("once").unwrap();
    let status = supervisor
        .wait_for("once", WAIT, |s| {
            s.phase == UnitPhase::Stopped && s.last_exit.is_some()
        })
        .await
        .unwrap();

    assert_eq!(status.restarts, 0);
    assert!(matches!(status.last_failure, Some(Failure::Crash(exit)) if exit.code == Some(2)));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_second_request_while_busy_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor.add(sleeper(temp_dir.path(), "web")).unwrap();

    supervisor.start("web").unwrap();
    supervisor.settle("web", WAIT).await.unwrap();

    let stop = supervisor.stop("web", Some(Duration::from_secs(2)));
    let restart = supervisor.restart("web");
    assert!(stop.is_ok());
    assert!(matches!(restart, Err(WardenError::Busy(_))));
    assert_eq!(restart.unwrap_err().exit_code(), 2);

    let status = supervisor.settle("web", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Stopped);
    assert_eq!(status.restarts, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor.add(sleeper(temp_dir.path(), "web")).unwrap();

    assert!(matches!(
        supervisor.stop("web", None),
        Err(WardenError::InvalidTransition { .. })
    ));

    supervisor.start("web").unwrap();
    supervisor.settle("web", WAIT).await.unwrap();
    assert!(matches!(
        supervisor.start("web"),
        Err(WardenError::InvalidTransition { .. })
    ));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_restart_running_unit() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor.add(sleeper(temp_dir.path(), "web")).unwrap();

    supervisor.start("web").unwrap();
    let before = supervisor.settle("web", WAIT).await.unwrap();
    let old_pid = before.pid.unwrap();

    supervisor.restart("web").unwrap();
    let after = supervisor.settle("web", WAIT).await.unwrap();
    assert_eq!(after.phase, UnitPhase::Running);
    assert_eq!(after.restarts, 1);
    assert_ne!(after.pid, Some(old_pid));
    assert!(!is_alive(old_pid));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_preempts_backoff() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "slow",
            "/bin/sh",
            &["-c", "exit 1"],
            |c| c.restart_delay = 30_000,
        ))
        .unwrap();

    supervisor.start("slow").unwrap();
    supervisor
        .wait_for("slow", WAIT, |s| s.phase == UnitPhase::CrashedBackoff)
        .await
        .unwrap();

    supervisor.stop("slow", None).unwrap();
    let status = supervisor.settle("slow", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Stopped);
    assert_eq!(status.restarts, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_kill_after_grace_period() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "stubborn",
            "/bin/sh",
            &["-c", "trap '' TERM; while true; do sleep 0.1; done"],
            |_| {},
        ))
        .unwrap();

    supervisor.start("stubborn").unwrap();
    supervisor.settle("stubborn", WAIT).await.unwrap();
    // Let the shell install its trap before signalling
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    supervisor
        .stop("stubborn", Some(Duration::from_millis(300)))
        .unwrap();
    let status = supervisor.settle("stubborn", WAIT).await.unwrap();

    assert_eq!(status.phase, UnitPhase::Stopped);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(status.last_exit.and_then(|e| e.signal), Some(9));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_memory_ceiling_forces_restart() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(SupervisorConfig {
        sample_interval: Duration::from_millis(100),
    });
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "hungry",
            "/bin/sleep",
            &["30"],
            |c| c.max_memory_restart = Some(Size::Bytes(1)),
        ))
        .unwrap();

    supervisor.start("hungry").unwrap();
    let status = supervisor
        .wait_for("hungry", WAIT, |s| s.restarts >= 1)
        .await
        .unwrap();

    assert!(matches!(
        status.last_failure,
        Some(Failure::ResourceExceeded { limit: 1, .. })
    ));
    // Memory restarts do not count against the crash budget
    assert_eq!(status.recent_exits, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_ready_port_open_reaches_running() {
    let temp_dir = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "api",
            "/bin/sleep",
            &["30"],
            |c| {
                c.ready_port = Some(port);
                c.listen_timeout = 5_000;
            },
        ))
        .unwrap();

    supervisor.start("api").unwrap();
    let status = supervisor.settle("api", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Running);

    supervisor.shutdown().await;
    drop(listener);
}

#[tokio::test]
async fn test_ready_port_timeout_fails_unit() {
    let temp_dir = TempDir::new().unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "deaf",
            "/bin/sleep",
            &["30"],
            |c| {
                c.ready_port = Some(port);
                c.listen_timeout = 300;
            },
        ))
        .unwrap();

    supervisor.start("deaf").unwrap();
    let status = supervisor.settle("deaf", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Failed);
    assert!(matches!(status.last_failure, Some(Failure::StartTimeout(_))));
    assert_eq!(status.pid, None);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_output_reaches_log_files() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    let spec = create_test_spec(
        temp_dir.path(),
        "chatty",
        "/bin/sh",
        &["-c", "echo to-out; echo to-err >&2; sleep 30"],
        |c| c.log_file = Some("combined.log".into()),
    );
    let logs = spec.logs.clone();
    supervisor.add(spec).unwrap();

    supervisor.start("chatty").unwrap();
    supervisor.settle("chatty", WAIT).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let combined = std::fs::read_to_string(temp_dir.path().join("combined.log"))
            .unwrap_or_default();
        if combined.contains("to-out") && combined.contains("to-err") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "logs never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    supervisor.shutdown().await;

    let out = std::fs::read_to_string(&logs.out).unwrap();
    let err = std::fs::read_to_string(&logs.err).unwrap();
    assert_eq!(out, "to-out\n");
    assert_eq!(err, "to-err\n");
}

#[tokio::test]
async fn test_list_and_remove() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    supervisor.add(sleeper(temp_dir.path(), "zeta")).unwrap();
    supervisor.add(sleeper(temp_dir.path(), "alpha")).unwrap();

    let names: Vec<_> = supervisor.list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);

    supervisor.start("zeta").unwrap();
    let pid = supervisor.settle("zeta", WAIT).await.unwrap().pid.unwrap();

    supervisor.remove("zeta").await.unwrap();
    assert!(!is_alive(pid));
    assert_eq!(supervisor.names(), vec!["alpha"]);

    supervisor.shutdown().await;
    assert!(supervisor.names().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_every_unit() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::with_defaults();
    for name in ["a", "b", "c"] {
        supervisor.add(sleeper(temp_dir.path(), name)).unwrap();
    }

    supervisor.start_all();
    let mut pids = Vec::new();
    for name in ["a", "b", "c"] {
        pids.push(supervisor.settle(name, WAIT).await.unwrap().pid.unwrap());
    }

    supervisor.shutdown().await;
    assert!(pids.iter().all(|&pid| !is_alive(pid)));
}

#[tokio::test]
async fn test_crash_stops_leftover_group_members() {
    let temp_dir = TempDir::new().unwrap();
    let pid_file = temp_dir.path().join("orphan.pid");
    let script = format!(
        "sleep 30 & echo $! > {}; sleep 0.3; exit 1",
        pid_file.display()
    );

    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "forker",
            "/bin/sh",
            &["-c", &script],
            |c| c.autorestart = false,
        ))
        .unwrap();

    supervisor.start("forker").unwrap();
    let orphan = read_pid(&pid_file).await;
    assert!(is_alive(orphan));

    let status = supervisor
        .wait_for("forker", WAIT, |s| {
            s.phase == UnitPhase::Stopped && s.last_exit.is_some()
        })
        .await
        .unwrap();
    assert_eq!(status.last_exit.and_then(|e| e.code), Some(1));
    assert!(!is_alive(orphan));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crash_restart_does_not_inherit_old_group() {
    let temp_dir = TempDir::new().unwrap();
    let pid_file = temp_dir.path().join("orphan.pid");
    let script = format!(
        "sleep 30 & echo $! > {}; sleep 0.3; exit 1",
        pid_file.display()
    );

    let supervisor = Supervisor::with_defaults();
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "forker",
            "/bin/sh",
            &["-c", &script],
            |c| c.restart_delay = 5_000,
        ))
        .unwrap();

    supervisor.start("forker").unwrap();
    let orphan = read_pid(&pid_file).await;

    supervisor
        .wait_for("forker", WAIT, |s| s.phase == UnitPhase::CrashedBackoff)
        .await
        .unwrap();
    assert!(!is_alive(orphan));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_repeated_memory_breaches_back_off() {
    let temp_dir = TempDir::new().unwrap();
    let supervisor = Supervisor::new(SupervisorConfig {
        sample_interval: Duration::from_millis(50),
    });
    supervisor
        .add(create_test_spec(
            temp_dir.path(),
            "hungry",
            "/bin/sleep",
            &["30"],
            |c| {
                c.max_memory_restart = Some(Size::Bytes(1));
                c.restart_delay = 1_000;
            },
        ))
        .unwrap();

    supervisor.start("hungry").unwrap();
    supervisor
        .wait_for("hungry", WAIT, |s| s.restarts >= 1)
        .await
        .unwrap();

    // The second breach waits a full restart delay before starting again
    let status = supervisor
        .wait_for("hungry", WAIT, |s| {
            s.phase == UnitPhase::Restarting && s.pid.is_none()
        })
        .await
        .unwrap();
    assert_eq!(status.restarts, 1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(supervisor.status("hungry").unwrap().restarts, 1);

    // Stop cuts the delay short
    supervisor.stop("hungry", None).unwrap();
    let status = supervisor.settle("hungry", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Stopped);
    assert_eq!(status.recent_exits, 0);

    supervisor.shutdown().await;
}
