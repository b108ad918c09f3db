//! # Parley Voice - local voice turn orchestration
//!
//! Supervises the local speech-to-text and text-to-speech servers and drives a
//! single voice turn at a time through them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      VoiceTurnStateMachine                       │
//! │  Recording → Trimming → Transcribing → AwaitingReply →           │
//! │              Synthesizing → Playing → Idle                       │
//! │       ↑ mic chunks         ↓ SpeechClient (HTTP)     ↓ audio out │
//! │  ┌────────────┐     ┌─────────────┐  ┌──────────┐  ┌──────────┐  │
//! │  │ Microphone │     │ STT server  │  │   chat   │  │  Output  │  │
//! │  │  (cpal)    │     │ TTS server  │  │ endpoint │  │ (rodio)  │  │
//! │  └────────────┘     └─────────────┘  └──────────┘  └──────────┘  │
//! │                            ↑ launch / health / restart           │
//! │                   ProcessSupervisor ── ReadinessGate ──→ start?  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
#[cfg(feature = "devices")]
pub mod devices;
pub mod error;
pub mod health;
pub mod playback;
pub mod recording;
pub mod settings;
pub mod supervisor;
pub mod turn;
pub mod wav;

pub use audio::{compute_rms, contains_speech, trim_silence, AudioBuffer};
pub use client::{
    ChatMessage, ChatRole, ModelCatalog, ModelParams, SpeechBackend, SpeechClient, Transcript,
    Transcription, VoiceCatalog, VoiceParams,
};
#[cfg(feature = "devices")]
pub use devices::{CpalMicrophone, RodioOutput};
pub use error::{
    AudioError, ClientError, SettingsError, SupervisorError, VoiceError, VoiceResult,
};
pub use health::{HealthProbe, HealthStatus, HealthTarget, Reachability, ReadinessReport};
pub use playback::{play_bounded, AudioOutput, PlaybackOutcome};
pub use recording::{record, MicrophoneSource, RecordingLimits, StopReason};
pub use settings::{ActivationMode, ApiKey, BackendKind, SettingsStore, VoiceSettings};
pub use supervisor::{
    ProcessSupervisor, Readiness, ReadinessGate, RestartPolicy, ServerDescriptor, ServerState,
    ServerStatus,
};
pub use turn::{TurnEvent, TurnId, TurnRejected, TurnState, VoiceTurn, VoiceTurnStateMachine};
pub use wav::{decode_wav, encode_wav, WAV_HEADER_LEN};
