//! Voice turn state machine
//!
//! Runs one record → trim → transcribe → reply → synthesize → play cycle at a
//! time. A turn starts only when the readiness gate is open and no other turn
//! is active; a second request is rejected, never queued. Every stage checks
//! the turn's cancellation token before it begins, and every await inside a
//! stage aborts when it fires.

use crate::audio::{contains_speech, trim_silence, AudioBuffer};
use crate::client::{ChatMessage, ModelParams, SpeechClient, Transcription, VoiceParams};
use crate::error::{ClientError, VoiceError, VoiceResult};
use crate::playback::{play_bounded, AudioOutput, PlaybackOutcome};
use crate::recording::{record, MicrophoneSource, RecordingLimits, StopReason};
use crate::settings::{ActivationMode, VoiceSettings};
use crate::supervisor::ReadinessGate;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(Uuid);

impl TurnId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Recording,
    Trimming,
    Transcribing,
    AwaitingReply,
    Synthesizing,
    Playing,
    Failed,
    Cancelled,
}

/// Why a start request was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRejected {
    #[error("speech servers are not ready")]
    NotReady,

    #[error("a turn is already in progress")]
    TurnActive,
}

/// Status updates for whoever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged { turn: TurnId, state: TurnState },
    Transcript { turn: TurnId, text: String },
    Reply { turn: TurnId, text: String },
    NoSpeechDetected { turn: TurnId },
    Completed { turn: TurnId },
    Failed { turn: TurnId, message: String },
    Cancelled { turn: TurnId },
}

/// One user interaction. Each stage output can be set exactly once.
#[derive(Debug)]
pub struct VoiceTurn {
    id: TurnId,
    started_at: DateTime<Utc>,
    transcript: OnceCell<String>,
    reply_text: OnceCell<String>,
    reply_audio: OnceCell<AudioBuffer>,
}

impl VoiceTurn {
    pub fn new() -> Self {
        Self {
            id: TurnId::new(),
            started_at: Utc::now(),
            transcript: OnceCell::new(),
            reply_text: OnceCell::new(),
            reply_audio: OnceCell::new(),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.get().map(String::as_str)
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.reply_text.get().map(String::as_str)
    }

    pub fn reply_audio(&self) -> Option<&AudioBuffer> {
        self.reply_audio.get()
    }

    pub fn set_transcript(&self, text: String) -> VoiceResult<()> {
        self.transcript
            .set(text)
            .map_err(|_| VoiceError::AlreadySet("transcript"))
    }

    pub fn set_reply_text(&self, text: String) -> VoiceResult<()> {
        self.reply_text
            .set(text)
            .map_err(|_| VoiceError::AlreadySet("reply text"))
    }

    pub fn set_reply_audio(&self, audio: AudioBuffer) -> VoiceResult<()> {
        self.reply_audio
            .set(audio)
            .map_err(|_| VoiceError::AlreadySet("reply audio"))
    }
}

impl Default for VoiceTurn {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a pipeline stopped short of playing a reply.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    NoSpeech,
    Failed(VoiceError),
}

impl From<ClientError> for Interrupt {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Cancelled => Interrupt::Cancelled,
            other => Interrupt::Failed(other.into()),
        }
    }
}

impl From<VoiceError> for Interrupt {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Client(ClientError::Cancelled) => Interrupt::Cancelled,
            other => Interrupt::Failed(other),
        }
    }
}

/// Settings and client captured together when a turn starts.
#[derive(Clone)]
struct TurnSetup {
    settings: VoiceSettings,
    client: SpeechClient,
}

struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
    stop: Arc<Notify>,
}

struct Shared {
    setup: RwLock<TurnSetup>,
    microphone: Arc<dyn MicrophoneSource>,
    output: Arc<dyn AudioOutput>,
    readiness: ReadinessGate,
    history: Mutex<VecDeque<ChatMessage>>,
    active: Mutex<Option<ActiveTurn>>,
    state: watch::Sender<TurnState>,
    events: mpsc::UnboundedSender<TurnEvent>,
}

pub struct VoiceTurnStateMachine {
    shared: Arc<Shared>,
}

impl VoiceTurnStateMachine {
    /// Build the state machine and the receiving end of its event stream.
    pub fn new(
        settings: VoiceSettings,
        client: SpeechClient,
        microphone: Arc<dyn MicrophoneSource>,
        output: Arc<dyn AudioOutput>,
        readiness: ReadinessGate,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TurnState::Idle);
        let shared = Arc::new(Shared {
            setup: RwLock::new(TurnSetup { settings, client }),
            microphone,
            output,
            readiness,
            history: Mutex::new(VecDeque::new()),
            active: Mutex::new(None),
            state,
            events,
        });
        (Self { shared }, events_rx)
    }

    /// Begin a new turn in `Recording`. Must be called from within a Tokio runtime.
    pub fn start_turn(&self) -> Result<TurnId, TurnRejected> {
        if !self.shared.readiness.is_ready() {
            info!(readiness = ?self.shared.readiness.current(), "turn rejected: servers not ready");
            return Err(TurnRejected::NotReady);
        }

        let mut active = lock(&self.shared.active);
        if active.is_some() {
            debug!("turn rejected: another turn is active");
            return Err(TurnRejected::TurnActive);
        }

        let turn = VoiceTurn::new();
        let id = turn.id();
        let cancel = CancellationToken::new();
        let stop = Arc::new(Notify::new());
        let setup = self.shared.setup();
        *active = Some(ActiveTurn {
            id,
            cancel: cancel.clone(),
            stop: Arc::clone(&stop),
        });
        self.shared.transition(id, TurnState::Recording);
        drop(active);

        info!(turn_id = %id, "🎤 turn started");
        let shared = Arc::clone(&self.shared);
        tokio::spawn(
            async move { shared.run(turn, setup, cancel, stop).await }
                .instrument(info_span!("turn", turn_id = %id)),
        );
        Ok(id)
    }

    /// End the recording stage early. Returns false when no turn is active.
    pub fn stop_recording(&self) -> bool {
        match lock(&self.shared.active).as_ref() {
            Some(turn) => {
                turn.stop.notify_one();
                true
            }
            None => false,
        }
    }

    /// Abort the active turn at whatever stage it is in.
    pub fn cancel(&self) -> bool {
        match lock(&self.shared.active).as_ref() {
            Some(turn) => {
                info!(turn_id = %turn.id, "cancelling turn");
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Push-to-talk pressed. Returns the new turn's id when one was started.
    pub fn activation_pressed(&self) -> Result<Option<TurnId>, TurnRejected> {
        let mode = self.shared.setup().settings.activation_mode;
        match (mode, self.state()) {
            (ActivationMode::Toggle, TurnState::Recording) => {
                self.stop_recording();
                Ok(None)
            }
            _ => self.start_turn().map(Some),
        }
    }

    /// Push-to-talk released. Only ends recording in hold mode.
    pub fn activation_released(&self) -> bool {
        match self.shared.setup().settings.activation_mode {
            ActivationMode::Hold if self.state() == TurnState::Recording => self.stop_recording(),
            _ => false,
        }
    }

    pub fn state(&self) -> TurnState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.shared.state.subscribe()
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        lock(&self.shared.active).as_ref().map(|t| t.id)
    }

    /// Conversation carried into the next chat request (system prompt excluded).
    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.shared.history).iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.shared.history).clear();
    }

    /// Replace the settings used by turns started from now on. The speech
    /// client is rebuilt from them; an in-flight turn keeps what it captured.
    pub fn update_settings(&self, settings: VoiceSettings) {
        let client = SpeechClient::from_settings(&settings);
        *self
            .shared
            .setup
            .write()
            .unwrap_or_else(PoisonError::into_inner) = TurnSetup { settings, client };
    }
}

impl Drop for VoiceTurnStateMachine {
    fn drop(&mut self) {
        if let Some(turn) = lock(&self.shared.active).as_ref() {
            turn.cancel.cancel();
        }
    }
}

impl Shared {
    fn setup(&self) -> TurnSetup {
        self.setup
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: TurnEvent) {
        if let Err(e) = self
            .events
            .send(event)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
        {
            debug!(error = %e, "no listener for turn events");
        }
    }

    fn transition(&self, turn: TurnId, state: TurnState) {
        let previous = self.state.send_replace(state);
        debug!(from = ?previous, to = ?state, "turn state");
        self.emit(TurnEvent::StateChanged { turn, state });
    }

    /// Move to `state` unless the turn has been cancelled.
    fn enter(&self, turn: TurnId, state: TurnState, cancel: &CancellationToken) -> Result<(), Interrupt> {
        if cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        self.transition(turn, state);
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        turn: VoiceTurn,
        setup: TurnSetup,
        cancel: CancellationToken,
        stop: Arc<Notify>,
    ) {
        let id = turn.id();
        match self.pipeline(&turn, &setup, &cancel, &stop).await {
            Ok(()) => {
                self.remember(&turn, setup.settings.max_history_messages);
                info!("✅ turn completed");
                self.emit(TurnEvent::Completed { turn: id });
            }
            Err(Interrupt::NoSpeech) => {
                info!("no speech detected");
                self.emit(TurnEvent::NoSpeechDetected { turn: id });
            }
            Err(Interrupt::Failed(e)) => {
                error!(error = %e, "turn failed");
                self.transition(id, TurnState::Failed);
                self.emit(TurnEvent::Failed {
                    turn: id,
                    message: e.to_string(),
                });
            }
            Err(Interrupt::Cancelled) => {
                self.output.stop();
                info!("turn cancelled");
                self.transition(id, TurnState::Cancelled);
                self.emit(TurnEvent::Cancelled { turn: id });
            }
        }

        let mut active = lock(&self.active);
        if active.as_ref().map(|t| t.id) == Some(id) {
            *active = None;
        }
        self.transition(id, TurnState::Idle);
    }

    async fn pipeline(
        &self,
        turn: &VoiceTurn,
        setup: &TurnSetup,
        cancel: &CancellationToken,
        stop: &Notify,
    ) -> Result<(), Interrupt> {
        let settings = &setup.settings;
        let id = turn.id();

        // Recording was entered by start_turn. The receiver is our claim on the mic.
        let mut chunks = self.microphone.open()?;
        let (recorded, reason) = record(
            &mut chunks,
            self.microphone.sample_rate(),
            self.microphone.channels(),
            &RecordingLimits::from_settings(settings),
            stop,
            cancel,
        )
        .await;
        drop(chunks);
        if reason == StopReason::Cancelled {
            return Err(Interrupt::Cancelled);
        }
        info!(?reason, duration = ?recorded.duration(), "recording stopped");

        self.enter(id, TurnState::Trimming, cancel)?;
        let trimmed = trim_silence(&recorded, settings.silence_threshold);
        drop(recorded);
        if !contains_speech(&trimmed, settings.min_speech_rms) {
            return Err(Interrupt::NoSpeech);
        }

        self.enter(id, TurnState::Transcribing, cancel)?;
        let transcript = transcribe_with_retry(setup, &trimmed, cancel).await?;
        drop(trimmed);
        turn.set_transcript(transcript.clone())?;
        info!(text = %transcript, "📝 transcript");
        self.emit(TurnEvent::Transcript {
            turn: id,
            text: transcript.clone(),
        });

        self.enter(id, TurnState::AwaitingReply, cancel)?;
        let messages = self.conversation(settings, &transcript);
        let reply = setup
            .client
            .chat_complete(
                &messages,
                &ModelParams::from_settings(settings),
                settings.chat_timeout(),
                cancel,
            )
            .await?;
        if reply.is_empty() {
            return Err(Interrupt::Failed(
                ClientError::MalformedResponse("chat reply is empty".to_string()).into(),
            ));
        }
        turn.set_reply_text(reply.clone())?;
        self.emit(TurnEvent::Reply {
            turn: id,
            text: reply.clone(),
        });

        self.enter(id, TurnState::Synthesizing, cancel)?;
        let audio = setup
            .client
            .synthesize(
                &reply,
                &VoiceParams::from_settings(settings),
                settings.tts_timeout(),
                cancel,
            )
            .await?;
        turn.set_reply_audio(audio.clone())?;

        self.enter(id, TurnState::Playing, cancel)?;
        match play_bounded(
            self.output.as_ref(),
            audio,
            settings.response_volume,
            settings.playback_grace(),
            cancel,
        )
        .await?
        {
            PlaybackOutcome::Finished => Ok(()),
            PlaybackOutcome::Cancelled => Err(Interrupt::Cancelled),
        }
    }

    /// System prompt, prior exchanges, then the new user message.
    fn conversation(&self, settings: &VoiceSettings, transcript: &str) -> Vec<ChatMessage> {
        let history = lock(&self.history);
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !settings.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(settings.system_prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(transcript));
        messages
    }

    fn remember(&self, turn: &VoiceTurn, max_messages: usize) {
        let (Some(user), Some(reply)) = (turn.transcript(), turn.reply_text()) else {
            return;
        };
        let mut history = lock(&self.history);
        history.push_back(ChatMessage::user(user));
        history.push_back(ChatMessage::assistant(reply));
        while history.len() > max_messages {
            history.pop_front();
        }
    }
}

/// Transcribe, repeating only network failures and timeouts.
async fn transcribe_with_retry(
    setup: &TurnSetup,
    audio: &AudioBuffer,
    cancel: &CancellationToken,
) -> Result<String, Interrupt> {
    let attempts = setup.settings.stt_retry_attempts.saturating_add(1);
    let mut attempt = 1;
    loop {
        match setup
            .client
            .transcribe(audio, setup.settings.stt_timeout(), cancel)
            .await
        {
            Ok(Transcription::Text(transcript)) => return Ok(transcript.text),
            Ok(Transcription::NoSpeechDetected) => return Err(Interrupt::NoSpeech),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, attempts, error = %e, "transcription failed; retrying");
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
