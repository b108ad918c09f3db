//! Parley daemon
//!
//! Launches the local STT/TTS servers, opens the default microphone and
//! speaker, and drives voice turns from line commands on stdin:
//!
//! ```text
//! talk | press     start a turn (toggle mode: stop recording if one is running)
//! release          end recording in hold mode
//! stop             end recording now
//! cancel           abort the current turn
//! status           show servers, readiness, turn state and server catalogs
//! restart <name>   manually restart a managed server
//! volume <0..1>    change and persist the reply volume
//! clear            forget the conversation
//! quit
//! ```

use anyhow::Context;
use parley_voice::{
    BackendKind, CpalMicrophone, HealthProbe, HealthTarget, ProcessSupervisor, ReadinessGate,
    RestartPolicy, RodioOutput, ServerDescriptor, SettingsStore, SpeechBackend, SpeechClient,
    TurnEvent, VoiceTurnStateMachine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Health polling for servers this process does not manage.
const EXTERNAL_PROBE_INTERVAL: Duration = Duration::from_secs(2);
const EXTERNAL_READY_WAIT: Duration = Duration::from_secs(30);
const CATALOG_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before the settings read the environment)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(SettingsStore::default_path);
    let store = SettingsStore::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    let settings = store.snapshot();

    let supervisor = ProcessSupervisor::new(RestartPolicy::default(), HealthProbe::default());
    let shutdown = CancellationToken::new();
    let gate = match settings.backend {
        BackendKind::Local if settings.manage_local_servers => {
            for descriptor in [
                ServerDescriptor::stt_from_settings(&settings),
                ServerDescriptor::tts_from_settings(&settings),
            ] {
                let name = descriptor.name.clone();
                // Keep going: turns stay rejected until `restart` succeeds.
                if let Err(e) = supervisor.start(descriptor).await {
                    tracing::error!(server = %name, error = %e, "server did not start");
                }
            }
            supervisor.spawn_monitor();
            supervisor.readiness_gate()
        }
        BackendKind::Local => {
            let targets = vec![
                HealthTarget::new("stt", format!("{}/health", settings.local_stt_url())),
                HealthTarget::new("tts", format!("{}/health", settings.local_tts_url())),
            ];
            let mut gate = ReadinessGate::from_probe(
                HealthProbe::default(),
                targets,
                EXTERNAL_PROBE_INTERVAL,
                shutdown.clone(),
            );
            if !gate.wait_ready(EXTERNAL_READY_WAIT).await {
                tracing::warn!(
                    readiness = ?gate.current(),
                    "external speech servers are not answering; turns are refused until they answer"
                );
            }
            gate
        }
        BackendKind::Cloud => ReadinessGate::always_ready(),
    };

    let microphone = Arc::new(CpalMicrophone::new(settings.sample_rate));
    let output = Arc::new(RodioOutput::new().context("opening the audio output device")?);
    let client = SpeechClient::from_settings(&settings);
    let catalogs = client.clone();
    let (machine, mut events) =
        VoiceTurnStateMachine::new(settings, client, microphone, output, gate);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            report(&event);
        }
    });

    tracing::info!(
        settings = %settings_path.display(),
        mode = ?store.snapshot().activation_mode,
        "Parley daemon started; type `talk` to speak"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_command(line.trim(), &machine, &supervisor, &store, &catalogs).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    machine.cancel();
    shutdown.cancel();
    supervisor.shutdown().await;
    Ok(())
}

/// Run one command. Returns false when the daemon should exit.
async fn handle_command(
    line: &str,
    machine: &VoiceTurnStateMachine,
    supervisor: &ProcessSupervisor,
    store: &SettingsStore,
    catalogs: &SpeechClient,
) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("talk" | "press"), _) => match machine.activation_pressed() {
            Ok(Some(id)) => tracing::info!(turn_id = %id, "listening"),
            Ok(None) => tracing::info!("recording stopped"),
            Err(e) => tracing::warn!(error = %e, "cannot start a turn"),
        },
        (Some("release"), _) => {
            machine.activation_released();
        }
        (Some("stop"), _) => {
            if !machine.stop_recording() {
                tracing::info!("no turn in progress");
            }
        }
        (Some("cancel"), _) => {
            if !machine.cancel() {
                tracing::info!("no turn in progress");
            }
        }
        (Some("status"), _) => {
            for server in supervisor.status().await {
                println!(
                    "{:<4} {:?} pid={:?} restarts={} healthy={:?}",
                    server.name,
                    server.state,
                    server.pid,
                    server.restart_count,
                    server.last_health.map(|h| h.reachable)
                );
            }
            println!("readiness: {:?}", supervisor.readiness());
            println!("turn: {:?}", machine.state());
            if matches!(catalogs.backend(), SpeechBackend::Local { .. }) {
                print_catalogs(catalogs).await;
            }
        }
        (Some("restart"), Some(name)) => match supervisor.restart(name).await {
            Ok(status) => tracing::info!(server = %status.name, pid = ?status.pid, "server restarted"),
            Err(e) => tracing::error!(server = %name, error = %e, "restart failed"),
        },
        (Some("volume"), Some(value)) => match value.parse::<f32>() {
            Ok(volume) => match store.update(|s| s.response_volume = volume) {
                Ok(updated) => {
                    machine.update_settings(updated);
                    tracing::info!(volume, "volume updated");
                }
                Err(e) => tracing::warn!(error = %e, "volume not changed"),
            },
            Err(_) => tracing::warn!(value, "volume must be a number"),
        },
        (Some("clear"), _) => {
            machine.clear_history();
            tracing::info!("conversation cleared");
        }
        (Some("quit" | "exit"), _) => return false,
        (None, _) => {}
        (Some(other), _) => tracing::warn!(command = other, "unknown command"),
    }
    true
}

async fn print_catalogs(client: &SpeechClient) {
    match client.stt_models(CATALOG_TIMEOUT).await {
        Ok(c) => println!("stt models: {:?} (loaded: {:?})", c.models, c.current_model),
        Err(e) => println!("stt models: unavailable ({})", e),
    }
    match client.tts_models(CATALOG_TIMEOUT).await {
        Ok(c) => println!("tts models: {:?} (loaded: {:?})", c.models, c.current_model),
        Err(e) => println!("tts models: unavailable ({})", e),
    }
    match client.tts_voices(CATALOG_TIMEOUT).await {
        Ok(c) => println!("tts voices: {:?} (current: {:?})", c.voices, c.current_voice),
        Err(e) => println!("tts voices: unavailable ({})", e),
    }
}

fn report(event: &TurnEvent) {
    match event {
        TurnEvent::StateChanged { state, .. } => tracing::debug!(?state, "turn state"),
        TurnEvent::Transcript { text, .. } => println!("you:    {}", text),
        TurnEvent::Reply { text, .. } => println!("parley: {}", text),
        TurnEvent::NoSpeechDetected { .. } => println!("(no speech heard)"),
        TurnEvent::Completed { .. } => {}
        TurnEvent::Failed { message, .. } => println!("(turn failed: {})", message),
        TurnEvent::Cancelled { .. } => println!("(cancelled)"),
    }
}
