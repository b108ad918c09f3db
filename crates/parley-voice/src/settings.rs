//! Voice settings: a flat key-value record and the store that owns its persistence.
//!
//! Settings are layered defaults < TOML file < `PARLEY_*` environment. The
//! store is the only writer; every other component receives a snapshot by
//! value, so a value captured by an in-flight request never changes under it.

use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

/// API key wrapper that never prints its value.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Which servers answer STT and TTS requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Supervised local Whisper / TTS servers.
    #[default]
    Local,
    /// OpenAI-compatible `/audio/*` endpoints under `base_url`.
    Cloud,
}

/// How the push-to-talk control maps to recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    /// Record while the control is held.
    Hold,
    /// One press starts recording, the next press stops it.
    #[default]
    Toggle,
}

/// Every recognized option. Missing keys fall back to [`VoiceSettings::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub api_key: Option<ApiKey>,
    /// Base URL for chat completions and the cloud audio endpoints.
    pub base_url: String,
    pub chat_model: String,
    pub stt_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_speed: f32,
    pub backend: BackendKind,
    pub activation_mode: ActivationMode,

    pub max_recording_secs: f32,
    /// Amplitude at or below which a sample counts as silence.
    pub silence_threshold: f32,
    /// Trailing silence that ends a recording.
    pub silence_timeout_secs: f32,
    /// Minimum RMS of the trimmed recording for it to be sent to STT.
    pub min_speech_rms: f32,
    pub sample_rate: u32,

    pub response_volume: f32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    /// User + assistant messages kept between turns.
    pub max_history_messages: usize,

    pub stt_timeout_secs: f32,
    pub chat_timeout_secs: f32,
    pub tts_timeout_secs: f32,
    /// Extra time allowed past a clip's length before playback counts as stuck.
    pub playback_grace_secs: f32,
    /// Extra STT attempts after a network error or timeout. Chat and TTS are never repeated.
    pub stt_retry_attempts: u32,

    pub manage_local_servers: bool,
    pub python_path: String,
    pub stt_server_script: String,
    pub tts_server_script: String,
    pub server_host: String,
    pub stt_port: u16,
    pub tts_port: u16,
    pub whisper_model: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
            backend: BackendKind::Local,
            activation_mode: ActivationMode::Toggle,
            max_recording_secs: 30.0,
            silence_threshold: 0.02,
            silence_timeout_secs: 2.0,
            min_speech_rms: 0.01,
            sample_rate: 16000,
            response_volume: 1.0,
            max_tokens: 150,
            temperature: 0.7,
            system_prompt: "You are a friendly virtual companion. Keep replies short and conversational."
                .to_string(),
            max_history_messages: 10,
            stt_timeout_secs: 30.0,
            chat_timeout_secs: 60.0,
            tts_timeout_secs: 60.0,
            playback_grace_secs: 5.0,
            stt_retry_attempts: 0,
            manage_local_servers: true,
            python_path: "python3".to_string(),
            stt_server_script: "WhisperServer/whisper_server.py".to_string(),
            tts_server_script: "TTSServer/tts_server.py".to_string(),
            server_host: "127.0.0.1".to_string(),
            stt_port: 8001,
            tts_port: 8002,
            whisper_model: "base".to_string(),
        }
    }
}

impl VoiceSettings {
    pub fn max_recording(&self) -> Duration {
        secs(self.max_recording_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        secs(self.silence_timeout_secs)
    }

    pub fn stt_timeout(&self) -> Duration {
        secs(self.stt_timeout_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        secs(self.chat_timeout_secs)
    }

    pub fn tts_timeout(&self) -> Duration {
        secs(self.tts_timeout_secs)
    }

    pub fn playback_grace(&self) -> Duration {
        secs(self.playback_grace_secs)
    }

    pub fn local_stt_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.stt_port)
    }

    pub fn local_tts_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.tts_port)
    }

    /// Check ranges. The first offending key is reported.
    pub fn validate(&self) -> Result<(), SettingsError> {
        unit_range("silence_threshold", self.silence_threshold)?;
        unit_range("min_speech_rms", self.min_speech_rms)?;
        unit_range("response_volume", self.response_volume)?;
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid("temperature", "must be within 0.0..=2.0"));
        }
        if !(self.tts_speed > 0.0 && self.tts_speed <= 4.0) {
            return Err(invalid("tts_speed", "must be within (0.0, 4.0]"));
        }
        for (key, value) in [
            ("max_recording_secs", self.max_recording_secs),
            ("silence_timeout_secs", self.silence_timeout_secs),
            ("stt_timeout_secs", self.stt_timeout_secs),
            ("chat_timeout_secs", self.chat_timeout_secs),
            ("tts_timeout_secs", self.tts_timeout_secs),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(key, "must be a positive number of seconds"));
            }
        }
        if !(self.playback_grace_secs.is_finite() && self.playback_grace_secs >= 0.0) {
            return Err(invalid("playback_grace_secs", "must not be negative"));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if self.backend == BackendKind::Cloud && self.api_key.is_none() {
            return Err(invalid("api_key", "required for the cloud backend"));
        }
        Ok(())
    }
}

fn secs(value: f32) -> Duration {
    Duration::from_secs_f32(value.max(0.0))
}

fn unit_range(key: &'static str, value: f32) -> Result<(), SettingsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(key, "must be within 0.0..=1.0"))
    }
}

fn invalid(key: &'static str, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// Owner of the persisted settings. Reads hand out snapshots; writes go
/// through [`SettingsStore::update`].
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<VoiceSettings>,
}

impl SettingsStore {
    /// Default settings file, relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from("parley.toml")
    }

    /// Load from `path` (missing file is fine) and the `PARLEY_*` environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let built = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: VoiceSettings = built.try_deserialize()?;
        settings.validate()?;

        info!(path = %path.display(), backend = ?settings.backend, "settings loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(settings),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(settings: VoiceSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            path: None,
            current: RwLock::new(settings),
        })
    }

    pub fn snapshot(&self) -> VoiceSettings {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply `change`, validate, persist, and return the new snapshot.
    /// Nothing is stored when validation fails.
    pub fn update<F>(&self, change: F) -> Result<VoiceSettings, SettingsError>
    where
        F: FnOnce(&mut VoiceSettings),
    {
        let mut next = self.snapshot();
        change(&mut next);
        next.validate()?;
        {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = next.clone();
        }
        self.save()?;
        Ok(next)
    }

    /// Write the current settings to the backing file (no-op for in-memory stores).
    pub fn save(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = toml::to_string_pretty(&self.snapshot())
            .map_err(|e| SettingsError::Save(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Save(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| SettingsError::Save(e.to_string()))?;
        debug!(path = %path.display(), "settings saved");
        Ok(())
    }
}
