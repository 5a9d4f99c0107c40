#![cfg(unix)]
//! Launch, reuse and teardown of the backend against mock health servers and
//! mock backend scripts.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use chatbridge::config::BackendConfig;
use chatbridge::error::SupervisorError;
use chatbridge::supervisor::{LaunchOptions, ProcessSupervisor};
use tokio::net::TcpListener;

async fn health_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new().route("/global/health", get(|| async { "ok" }));
    tokio::spawn(async move { axum::serve(listener, app).await });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Write an executable shell script standing in for the backend binary.
fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("fake-backend");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn config_with(binary: Option<PathBuf>) -> BackendConfig {
    BackendConfig {
        binary_name: "chatbridge-test-backend-none".to_string(),
        binary_override: binary.map(|p| p.to_string_lossy().into_owned()),
        default_port: closed_port().await,
        alternate_ports: Vec::new(),
        probe_timeout_ms: 300,
        announce_timeout_secs: 10,
        terminate_grace_secs: 2,
        ..BackendConfig::default()
    }
}

const ANNOUNCE: &str = "echo 'starting'; echo 'opencode server listening on http://127.0.0.1:4096'";

#[tokio::test]
async fn test_reuses_responding_port_without_spawning() {
    let live = health_server().await;
    let mut config = config_with(Some(PathBuf::from("/nonexistent/backend"))).await;
    config.alternate_ports = vec![live];
    let supervisor = ProcessSupervisor::new(config);

    let launch = supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap();
    assert!(launch.connection.reused);
    assert_eq!(launch.connection.port, live);
    assert!(launch.process.is_none());
    assert!(!supervisor.has_process().await);
    assert_eq!(supervisor.last_port().await, Some(live));
}

#[tokio::test]
async fn test_spawns_and_parses_announcement() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(&dir, &format!("{ANNOUNCE}; exec sleep 30"));
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    let launch = supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap();
    assert_eq!(launch.connection.port, 4096);
    assert_eq!(launch.connection.base_url, "http://127.0.0.1:4096");
    assert_eq!(launch.connection.ui_base, "http://127.0.0.1:4096/");
    assert!(!launch.connection.reused);
    assert!(supervisor.has_process().await);
    assert_eq!(
        supervisor.shared_connection().await,
        Some(launch.connection.clone())
    );

    supervisor.terminate().await;
    supervisor.terminate().await;
    assert!(!supervisor.has_process().await);
    assert_eq!(supervisor.shared_connection().await, None);
}

#[tokio::test]
async fn test_terminate_without_process_is_noop() {
    let supervisor = ProcessSupervisor::new(config_with(None).await);
    supervisor.terminate().await;
    supervisor.terminate().await;
    assert!(!supervisor.has_process().await);
}

#[tokio::test]
async fn test_retries_without_extra_args() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(
        &dir,
        &format!(
            "case \"$*\" in *--broken*) echo 'unknown flag --broken' >&2; exit 2;; esac\n\
             {ANNOUNCE}; exec sleep 30"
        ),
    );
    let mut config = config_with(Some(bin)).await;
    config.extra_args = Some("--broken".to_string());
    let supervisor = ProcessSupervisor::new(config);

    let launch = supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap();
    assert_eq!(launch.connection.port, 4096);
    supervisor.terminate().await;
}

#[tokio::test]
async fn test_exit_before_announcement_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(
        &dir,
        "echo 'Error: listen EADDRINUSE: address already in use' >&2; exit 1",
    );
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    let err = supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap_err();
    match err {
        SupervisorError::PortInUse { stderr } => assert!(stderr.contains("EADDRINUSE")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!supervisor.has_process().await);
}

#[tokio::test]
async fn test_plain_exit_keeps_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(&dir, "echo 'config file is corrupt' >&2; exit 7");
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    let err = supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap_err();
    match err {
        SupervisorError::ProcessExit { code, stderr } => {
            assert_eq!(code, Some(7));
            assert!(stderr.contains("config file is corrupt"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(&dir, "echo 'warming up' >&2; exec sleep 30");
    let mut config = config_with(Some(bin)).await;
    config.announce_timeout_secs = 1;
    let supervisor = ProcessSupervisor::new(config);

    let err = supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap_err();
    match err {
        SupervisorError::ConnectionTimeout { stderr, .. } => assert!(stderr.contains("warming up")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_forced_launch_leaves_shared_state_alone() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(&dir, &format!("{ANNOUNCE}; exec sleep 30"));
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    let launch = supervisor
        .launch(None, LaunchOptions { force_new: true })
        .await
        .unwrap();
    assert!(!launch.connection.reused);
    let process = launch.process.expect("forced launch hands back its process");
    assert!(!supervisor.has_process().await);
    assert_eq!(supervisor.last_port().await, None);
    assert_eq!(supervisor.shared_connection().await, None);

    let info = process.terminate(Duration::from_secs(2)).await;
    assert!(!info.success);
}

#[tokio::test]
async fn test_shared_state_cleared_when_backend_exits() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(&dir, &format!("{ANNOUNCE}; sleep 0.3; exit 3"));
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while supervisor.has_process().await {
        assert!(tokio::time::Instant::now() < deadline, "exit not observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(supervisor.shared_connection().await, None);
    // The port stays remembered for the next reuse probe.
    assert_eq!(supervisor.last_port().await, Some(4096));
}

#[tokio::test]
async fn test_concurrent_shared_launches_spawn_once() {
    let dir = tempfile::tempdir().unwrap();
    let pids = dir.path().join("pids");
    let bin = script(
        &dir,
        &format!(
            "echo $$ >> '{}'\nsleep 0.3\n{ANNOUNCE}; exec sleep 30",
            pids.display()
        ),
    );
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    let (first, second) = tokio::join!(
        supervisor.launch(None, LaunchOptions::default()),
        supervisor.launch(None, LaunchOptions::default()),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.connection, second.connection);
    assert!(second.process.is_none());

    let spawned = std::fs::read_to_string(&pids).unwrap();
    assert_eq!(spawned.lines().count(), 1, "{spawned}");
    supervisor.terminate().await;
}

#[tokio::test]
async fn test_relaunch_terminates_prior_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let bin = script(
        &dir,
        &format!(
            "trap 'echo stop $$ >> \"{log}\"; exit 0' TERM\n\
             echo start $$ >> '{log}'\n\
             {ANNOUNCE}\n\
             while :; do sleep 0.1; done",
            log = log.display()
        ),
    );
    let supervisor = ProcessSupervisor::new(config_with(Some(bin)).await);

    supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap();
    supervisor
        .launch(None, LaunchOptions::default())
        .await
        .unwrap();
    supervisor.terminate().await;

    let log = std::fs::read_to_string(&log).unwrap();
    let events: Vec<&str> = log
        .lines()
        .map(|l| l.split_whitespace().next().unwrap())
        .collect();
    assert_eq!(events, ["start", "stop", "start", "stop"], "{log}");
}

#[tokio::test]
async fn test_terminate_cancels_pending_launch_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let bin = script(&dir, "exec sleep 30");
    let mut config = config_with(Some(bin)).await;
    config.announce_timeout_secs = 30;
    let supervisor = ProcessSupervisor::new(config);

    let launching = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.launch(None, LaunchOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = tokio::time::Instant::now();
    supervisor.terminate().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = tokio::time::timeout(Duration::from_secs(5), launching)
        .await
        .expect("launch still pending after terminate")
        .unwrap();
    assert!(matches!(result, Err(SupervisorError::Cancelled)));
    assert!(!supervisor.has_process().await);
    assert_eq!(supervisor.shared_connection().await, None);
}
