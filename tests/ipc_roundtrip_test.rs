use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warden::config::{validate, Args, ProcessConfig, ValidationContext};
use warden::control::ControlSurface;
use warden::error::WardenError;
use warden::ipc::{Command, IpcClient, IpcServer, ResponseData};
use warden::process::{Operation, Supervisor, UnitPhase};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    supervisor: Supervisor,
    client: IpcClient,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

fn start_harness(dir: &Path, script_args: &[&str]) -> Harness {
    let mut record = ProcessConfig::new("web", "/bin/sh");
    record.args = Args::List(script_args.iter().map(|s| s.to_string()).collect());
    let ctx = ValidationContext {
        base_dir: dir.to_path_buf(),
        log_dir: dir.join("logs"),
    };
    let spec = validate(&[record], &ctx).unwrap().remove(0);

    let supervisor = Supervisor::with_defaults();
    supervisor.add(spec).unwrap();

    let socket = dir.join("warden.sock");
    let mut server = IpcServer::with_socket_path(&socket);
    server.start().unwrap();

    let (shutdown, rx) = oneshot::channel::<()>();
    let control = ControlSurface::new(supervisor.clone());
    let server = tokio::spawn(async move {
        server
            .run(control, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        server.stop().unwrap();
    });

    Harness {
        supervisor,
        client: IpcClient::with_socket_path(&socket),
        shutdown,
        server,
    }
}

impl Harness {
    async fn finish(self) {
        let _ = self.shutdown.send(());
        self.server.await.unwrap();
        self.supervisor.shutdown().await;
    }
}

#[tokio::test]
async fn test_lifecycle_over_socket() {
    let temp_dir = TempDir::new().unwrap();
    let harness = start_harness(temp_dir.path(), &["-c", "echo ready; sleep 30"]);

    let accepted = harness
        .client
        .send_command(Command::Start { name: "web".into() })
        .await
        .unwrap();
    assert!(matches!(
        accepted,
        ResponseData::Accepted {
            op: Operation::Start,
            ..
        }
    ));

    harness.supervisor.settle("web", WAIT).await.unwrap();

    match harness
        .client
        .send_command(Command::Status { name: "web".into() })
        .await
        .unwrap()
    {
        ResponseData::Status(status) => {
            assert_eq!(status.phase, UnitPhase::Running);
            assert!(status.pid.is_some());
        }
        other => panic!("unexpected response: {:?}", other),
    }

    match harness.client.send_command(Command::List).await.unwrap() {
        ResponseData::List(units) => {
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].name, "web");
        }
        other => panic!("unexpected response: {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    match harness
        .client
        .send_command(Command::Logs {
            name: "web".into(),
            lines: 5,
            filter: Some("rea".into()),
        })
        .await
        .unwrap()
    {
        ResponseData::Logs(entries) => assert!(entries.iter().any(|e| e.line == "ready")),
        other => panic!("unexpected response: {:?}", other),
    }

    harness
        .client
        .send_command(Command::Stop {
            name: "web".into(),
            grace_ms: Some(1_000),
        })
        .await
        .unwrap();
    let status = harness.supervisor.settle("web", WAIT).await.unwrap();
    assert_eq!(status.phase, UnitPhase::Stopped);

    harness.finish().await;
}

#[tokio::test]
async fn test_errors_carry_exit_codes() {
    let temp_dir = TempDir::new().unwrap();
    let harness = start_harness(temp_dir.path(), &["-c", "sleep 30"]);

    let missing = harness
        .client
        .send_command(Command::Restart {
            name: "ghost".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(missing.exit_code(), 1);
    assert!(missing.to_string().contains("ghost"));

    let rejected = harness
        .client
        .send_command(Command::Stop {
            name: "web".into(),
            grace_ms: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(rejected, WardenError::Remote { code: 2, .. }));

    harness
        .client
        .send_command(Command::Start { name: "web".into() })
        .await
        .unwrap();
    let busy = harness
        .client
        .send_command(Command::Restart { name: "web".into() })
        .await;
    // The start may already have settled; either way nothing else is accepted twice
    match busy {
        Err(e) => assert_eq!(e.exit_code(), 2),
        Ok(ResponseData::Accepted { op, .. }) => assert_eq!(op, Operation::Restart),
        Ok(other) => panic!("unexpected response: {:?}", other),
    }

    harness.supervisor.settle("web", WAIT).await.unwrap();
    harness.finish().await;
}

#[tokio::test]
async fn test_client_without_server() {
    let temp_dir = TempDir::new().unwrap();
    let client = IpcClient::with_socket_path(temp_dir.path().join("absent.sock"));

    let err = client.send_command(Command::List).await.unwrap_err();
    assert!(matches!(err, WardenError::SupervisorNotRunning));
    assert_eq!(err.exit_code(), 3);
}
