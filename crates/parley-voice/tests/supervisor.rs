//! Process supervision with real child processes (`sleep`, `false`) and a mock
//! health endpoint.

#![cfg(unix)]

mod common;

use common::{init_tracing, CapturingOutput, ScriptedMic};
use httpmock::prelude::*;
use parley_voice::{
    HealthProbe, ProcessSupervisor, Readiness, RestartPolicy, ServerDescriptor, ServerState,
    ServerStatus, SpeechClient, SupervisorError, TurnRejected, VoiceSettings,
    VoiceTurnStateMachine,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_policy(max_restarts: u32) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        poll_interval: Duration::from_millis(50),
        startup_attempts: 10,
        startup_interval: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
    }
}

fn supervisor(max_restarts: u32) -> ProcessSupervisor {
    ProcessSupervisor::new(fast_policy(max_restarts), HealthProbe::new(Duration::from_millis(200)))
}

async fn healthy_server() -> MockServer {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .json_body(serde_json::json!({"status": "healthy", "model_loaded": true}));
        })
        .await;
    server
}

fn sleeper(server: &MockServer) -> ServerDescriptor {
    ServerDescriptor::new("stt", "sleep", vec!["30".to_string()], server.host(), server.port())
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_status<F>(supervisor: &ProcessSupervisor, mut pred: F) -> ServerStatus
where
    F: FnMut(&ServerStatus) -> bool,
{
    for _ in 0..200 {
        if let Some(status) = supervisor.status().await.into_iter().find(|s| pred(s)) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached; last status {:?}", supervisor.status().await);
}

async fn wait_for_readiness<F>(supervisor: &ProcessSupervisor, pred: F) -> Readiness
where
    F: Fn(&Readiness) -> bool,
{
    for _ in 0..200 {
        let readiness = supervisor.readiness();
        if pred(&readiness) {
            return readiness;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("readiness stuck at {:?}", supervisor.readiness());
}

fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[tokio::test]
async fn missing_executable_blocks_turns() {
    init_tracing();
    let supervisor = supervisor(3);
    let descriptor = ServerDescriptor::new(
        "stt",
        "/nonexistent/parley/whisper-server",
        vec![],
        "127.0.0.1",
        free_port(),
    );

    let err = supervisor.start(descriptor).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Launch { ref server, .. } if server == "stt"));

    let gate = supervisor.readiness_gate();
    assert!(!gate.is_ready());

    let settings = VoiceSettings::default();
    let client = SpeechClient::from_settings(&settings);
    let (machine, _events) = VoiceTurnStateMachine::new(
        settings,
        client,
        Arc::new(ScriptedMic::silence(1)),
        Arc::new(CapturingOutput::default()),
        gate,
    );
    assert_eq!(machine.start_turn(), Err(TurnRejected::NotReady));
}

#[tokio::test]
async fn start_and_stop_a_healthy_server() {
    init_tracing();
    let server = healthy_server().await;
    let supervisor = supervisor(3);
    let mut gate = supervisor.readiness_gate();

    let status = supervisor.start(sleeper(&server)).await.unwrap();
    assert_eq!(status.state, ServerState::Running);
    assert!(status.pid.is_some());
    assert!(status.last_health.map_or(false, |h| h.reachable));
    assert!(gate.wait_ready(Duration::from_secs(1)).await);

    // starting again is a no-op
    let again = supervisor.start(sleeper(&server)).await.unwrap();
    assert_eq!(again.pid, status.pid);

    supervisor.stop("stt").await.unwrap();
    supervisor.stop("stt").await.unwrap();
    let stopped = &supervisor.status().await[0];
    assert_eq!(stopped.state, ServerState::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(!gate.is_ready());

    assert!(matches!(
        supervisor.stop("tts").await,
        Err(SupervisorError::UnknownServer(_))
    ));
}

#[tokio::test]
async fn crashed_server_is_restarted_then_declared_fatal() {
    init_tracing();
    let server = healthy_server().await;
    let supervisor = supervisor(1);
    supervisor.start(sleeper(&server)).await.unwrap();
    supervisor.spawn_monitor();

    let first = supervisor.status().await[0].pid.unwrap();
    kill(first);

    let restarted = wait_for_status(&supervisor, |s| {
        s.state == ServerState::Running && s.restart_count == 1
    })
    .await;
    let second = restarted.pid.unwrap();
    assert_ne!(second, first);
    wait_for_readiness(&supervisor, Readiness::is_ready).await;

    kill(second);
    wait_for_status(&supervisor, |s| s.state == ServerState::Fatal).await;
    let readiness = wait_for_readiness(&supervisor, |r| matches!(r, Readiness::Fatal { .. })).await;
    assert_eq!(
        readiness,
        Readiness::Fatal {
            server: "stt".to_string()
        }
    );

    // a manual restart clears the fatal state
    let status = supervisor.restart("stt").await.unwrap();
    assert_eq!(status.state, ServerState::Running);
    assert_eq!(status.restart_count, 0);
    assert!(supervisor.readiness().is_ready());

    supervisor.shutdown().await;
    assert_eq!(supervisor.status().await[0].state, ServerState::Stopped);
}

#[tokio::test]
async fn early_exit_on_busy_port_is_port_in_use() {
    let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = squatter.local_addr().unwrap().port();
    let supervisor = supervisor(3);

    let err = supervisor
        .start(ServerDescriptor::new("tts", "false", vec![], "127.0.0.1", port))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::PortInUse { port: p, .. } if p == port));
    assert!(matches!(supervisor.readiness(), Readiness::Fatal { .. }));
}

#[tokio::test]
async fn early_exit_on_free_port_is_launch_error() {
    let supervisor = supervisor(3);
    let err = supervisor
        .start(ServerDescriptor::new("tts", "false", vec![], "127.0.0.1", free_port()))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Launch { .. }));
}

#[tokio::test]
async fn never_healthy_server_is_killed_and_reported() {
    let supervisor = ProcessSupervisor::new(
        RestartPolicy {
            startup_attempts: 3,
            ..fast_policy(0)
        },
        HealthProbe::new(Duration::from_millis(100)),
    );
    let descriptor = ServerDescriptor::new("stt", "sleep", vec!["30".to_string()], "127.0.0.1", free_port());

    let err = supervisor.start(descriptor).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Launch { ref reason, .. } if reason.contains("not healthy")));
    assert_eq!(supervisor.status().await[0].state, ServerState::Failed);
}

#[tokio::test]
async fn stop_during_startup_discards_the_process() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200).delay(Duration::from_millis(150));
        })
        .await;
    let supervisor = Arc::new(supervisor(3));

    let starting = {
        let supervisor = Arc::clone(&supervisor);
        let descriptor = sleeper(&server);
        tokio::spawn(async move { supervisor.start(descriptor).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.stop("stt").await.unwrap();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(SupervisorError::StoppedDuringStart(ref n)) if n == "stt"));

    let status = &supervisor.status().await[0];
    assert_eq!(status.state, ServerState::Stopped);
    assert_eq!(status.pid, None);
    assert!(!supervisor.readiness().is_ready());
}
