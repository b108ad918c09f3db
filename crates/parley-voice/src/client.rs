//! HTTP client for speech-to-text, text-to-speech and chat completion.
//!
//! Each call is bounded by its own timeout and aborts as soon as the turn's
//! cancellation token fires. The client never retries; that decision belongs
//! to the caller.

use crate::audio::AudioBuffer;
use crate::error::ClientError;
use crate::settings::{ApiKey, BackendKind, VoiceSettings};
use crate::wav::{decode_wav, encode_wav};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where STT and TTS requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechBackend {
    /// The supervised local servers (`POST /transcribe`, `POST /synthesize`).
    Local { stt_base: String, tts_base: String },
    /// OpenAI-compatible `/audio/transcriptions` and `/audio/speech`.
    Cloud { base_url: String, api_key: ApiKey },
}

/// Transcription as returned by the STT server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    /// Kept opaque; only the text drives the turn.
    #[serde(default)]
    pub segments: Option<Vec<serde_json::Value>>,
}

/// `GET /models` of a local server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub models: Vec<String>,
    /// `None` while the server has no model loaded.
    #[serde(default)]
    pub current_model: Option<String>,
}

/// `GET /voices` of the local TTS server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceCatalog {
    #[serde(default)]
    pub voices: Vec<String>,
    #[serde(default)]
    pub current_voice: Option<String>,
}

/// Outcome of [`SpeechClient::transcribe`]. Silence is a result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Transcription {
    Text(Transcript),
    NoSpeechDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Synthesis options.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
    /// Only sent to the cloud backend.
    pub model: String,
}

impl VoiceParams {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            voice: settings.tts_voice.clone(),
            speed: settings.tts_speed,
            model: settings.tts_model.clone(),
        }
    }
}

/// Chat completion options.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelParams {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            model: settings.chat_model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeechClient {
    http: reqwest::Client,
    backend: SpeechBackend,
    /// Base for `/chat/completions`.
    chat_base: String,
    api_key: Option<ApiKey>,
    stt_model: String,
}

impl SpeechClient {
    pub fn new(backend: SpeechBackend, chat_base: impl Into<String>, api_key: Option<ApiKey>) -> Self {
        Self {
            http: reqwest::Client::new(),
            backend,
            chat_base: chat_base.into(),
            api_key,
            stt_model: "whisper-1".to_string(),
        }
    }

    /// Build a client for the backend selected in `settings`.
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        let backend = match settings.backend {
            BackendKind::Local => SpeechBackend::Local {
                stt_base: settings.local_stt_url(),
                tts_base: settings.local_tts_url(),
            },
            BackendKind::Cloud => SpeechBackend::Cloud {
                base_url: settings.base_url.clone(),
                api_key: settings.api_key.clone().unwrap_or_default(),
            },
        };
        Self::new(backend, settings.base_url.clone(), settings.api_key.clone())
            .with_stt_model(settings.stt_model.clone())
    }

    /// Model name sent with cloud transcription requests.
    pub fn with_stt_model(mut self, model: impl Into<String>) -> Self {
        self.stt_model = model.into();
        self
    }

    pub fn backend(&self) -> &SpeechBackend {
        &self.backend
    }

    /// Upload `audio` as WAV and return its transcription.
    pub async fn transcribe(
        &self,
        audio: &AudioBuffer,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Transcription, ClientError> {
        if audio.is_empty() {
            return Err(ClientError::InvalidRequest("empty audio buffer".to_string()));
        }
        let wav = encode_wav(audio);
        debug!(bytes = wav.len(), duration = ?audio.duration(), "sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        let request = match &self.backend {
            SpeechBackend::Local { stt_base, .. } => {
                let form = reqwest::multipart::Form::new()
                    .part("audio", part)
                    .text("response_format", "json");
                self.http.post(join(stt_base, "transcribe")).multipart(form)
            }
            SpeechBackend::Cloud { base_url, api_key } => {
                let form = reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("model", self.stt_model.clone());
                self.http
                    .post(join(base_url, "audio/transcriptions"))
                    .bearer_auth(api_key.expose())
                    .multipart(form)
            }
        };

        let body = bounded(cancel, timeout, async move {
            let response = request.send().await?;
            success_body(response).await
        })
        .await?;

        let transcript: Transcript = serde_json::from_slice(&body).map_err(|e| {
            error!(error = %e, "transcription response is not the expected JSON");
            ClientError::MalformedResponse(format!("transcription: {}", e))
        })?;

        if transcript.text.trim().is_empty() {
            info!("transcription came back empty");
            return Ok(Transcription::NoSpeechDetected);
        }
        info!(chars = transcript.text.len(), language = ?transcript.language, "transcription received");
        Ok(Transcription::Text(Transcript {
            text: transcript.text.trim().to_string(),
            ..transcript
        }))
    }

    /// Synthesize `text` and decode the returned WAV.
    pub async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AudioBuffer, ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::InvalidRequest("no text to synthesize".to_string()));
        }

        let request = match &self.backend {
            SpeechBackend::Local { tts_base, .. } => self.http.post(join(tts_base, "synthesize")).json(&json!({
                "text": text,
                "voice": params.voice,
                "response_format": "wav",
                "speed": params.speed,
            })),
            SpeechBackend::Cloud { base_url, api_key } => self
                .http
                .post(join(base_url, "audio/speech"))
                .bearer_auth(api_key.expose())
                .json(&json!({
                    "model": params.model,
                    "input": text,
                    "voice": params.voice,
                    "response_format": "wav",
                    "speed": params.speed,
                })),
        };
        debug!(chars = text.len(), voice = %params.voice, "requesting speech synthesis");

        let body = bounded(cancel, timeout, async move {
            let response = request.send().await?;
            success_body(response).await
        })
        .await?;

        let audio = decode_wav(&body)?;
        info!(duration = ?audio.duration(), sample_rate = audio.sample_rate(), "speech synthesized");
        Ok(audio)
    }

    /// Send an OpenAI-compatible chat request and return the first choice's text.
    pub async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        let mut request = self
            .http
            .post(join(&self.chat_base, "chat/completions"))
            .json(&json!({
                "model": params.model,
                "messages": messages,
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }
        debug!(model = %params.model, messages = messages.len(), "requesting chat completion");

        let body = bounded(cancel, timeout, async move {
            let response = request.send().await?;
            success_body(response).await
        })
        .await?;

        let json: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
            error!(error = %e, "chat response is not JSON");
            ClientError::MalformedResponse(format!("chat: {}", e))
        })?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                error!(body = %json, "chat response has no choices[0].message.content");
                ClientError::MalformedResponse("chat: missing choices".to_string())
            })?;
        Ok(content.trim().to_string())
    }
}

impl SpeechClient {
    /// Models the local STT server can load.
    pub async fn stt_models(&self, timeout: Duration) -> Result<ModelCatalog, ClientError> {
        let (stt_base, _) = self.local_bases()?;
        self.catalog(join(stt_base, "models"), timeout).await
    }

    /// Models the local TTS server can load.
    pub async fn tts_models(&self, timeout: Duration) -> Result<ModelCatalog, ClientError> {
        let (_, tts_base) = self.local_bases()?;
        self.catalog(join(tts_base, "models"), timeout).await
    }

    pub async fn tts_voices(&self, timeout: Duration) -> Result<VoiceCatalog, ClientError> {
        let (_, tts_base) = self.local_bases()?;
        self.catalog(join(tts_base, "voices"), timeout).await
    }

    fn local_bases(&self) -> Result<(&str, &str), ClientError> {
        match &self.backend {
            SpeechBackend::Local { stt_base, tts_base } => Ok((stt_base, tts_base)),
            SpeechBackend::Cloud { .. } => Err(ClientError::InvalidRequest(
                "catalogs are only served by the local servers".to_string(),
            )),
        }
    }

    async fn catalog<T: DeserializeOwned>(&self, url: String, timeout: Duration) -> Result<T, ClientError> {
        let request = self.http.get(&url);
        let body = tokio::time::timeout(timeout, async move {
            let response = request.send().await?;
            success_body(response).await
        })
        .await
        .unwrap_or_else(|_| Err(ClientError::Timeout))?;
        serde_json::from_slice(&body).map_err(|e| {
            error!(%url, error = %e, "catalog response is malformed");
            ClientError::MalformedResponse(format!("catalog: {}", e))
        })
    }
}

fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// Run `fut` under `timeout`, returning early with `Cancelled` if `cancel` fires.
async fn bounded<T, F>(cancel: &CancellationToken, timeout: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => {
            result.unwrap_or_else(|_| Err(ClientError::Timeout))
        }
    }
}

async fn success_body(response: reqwest::Response) -> Result<Vec<u8>, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.bytes().await?.to_vec())
}
