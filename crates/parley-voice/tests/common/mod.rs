//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use httpmock::MockServer;
use parley_voice::{
    AudioBuffer, AudioOutput, MicrophoneSource, TurnEvent, TurnState, VoiceResult, VoiceSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Replays fixed chunks 100 ms apart, then stays open like a live device.
pub struct ScriptedMic {
    chunks: Vec<Vec<f32>>,
}

impl ScriptedMic {
    /// `loud` chunks of speech-level audio followed by `quiet` chunks of silence.
    pub fn speech_then_silence(loud: usize, quiet: usize) -> Self {
        let mut chunks = vec![vec![0.3f32; 1600]; loud];
        chunks.extend(vec![vec![0.0f32; 1600]; quiet]);
        Self { chunks }
    }

    pub fn silence(quiet: usize) -> Self {
        Self::speech_then_silence(0, quiet)
    }
}

impl MicrophoneSource for ScriptedMic {
    fn open(&self) -> VoiceResult<mpsc::Receiver<Vec<f32>>> {
        let (tx, rx) = mpsc::channel(16);
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            tx.closed().await;
        });
        Ok(rx)
    }

    fn sample_rate(&self) -> u32 {
        16000
    }

    fn channels(&self) -> u16 {
        1
    }
}

/// Remembers every clip and reports it finished after `hold` (immediately by default).
#[derive(Default)]
pub struct CapturingOutput {
    pub played: Mutex<Vec<(AudioBuffer, f32)>>,
    pub stops: AtomicUsize,
    hold: Duration,
}

impl CapturingOutput {
    /// An output that keeps "playing" each clip for `hold`.
    pub fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Default::default()
        }
    }

    pub fn played_count(&self) -> usize {
        self.played.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for CapturingOutput {
    async fn play(&self, audio: AudioBuffer, volume: f32) -> VoiceResult<()> {
        self.played.lock().unwrap().push((audio, volume));
        tokio::time::sleep(self.hold).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Settings that point STT, TTS and chat at one mock server.
pub fn settings_for(server: &MockServer) -> VoiceSettings {
    VoiceSettings {
        server_host: server.host(),
        stt_port: server.port(),
        tts_port: server.port(),
        base_url: server.base_url(),
        silence_timeout_secs: 0.3,
        max_recording_secs: 5.0,
        stt_timeout_secs: 5.0,
        chat_timeout_secs: 5.0,
        tts_timeout_secs: 5.0,
        ..Default::default()
    }
}

/// Events up to and including the return to `Idle`.
pub async fn collect_turn(events: &mut mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        while let Some(event) = events.recv().await {
            let idle = matches!(
                event,
                TurnEvent::StateChanged {
                    state: TurnState::Idle,
                    ..
                }
            );
            seen.push(event);
            if idle {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "turn did not finish; saw {:?}", seen);
    seen
}

pub fn states(events: &[TurnEvent]) -> Vec<TurnState> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}
