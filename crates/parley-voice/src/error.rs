//! Error types for the Parley voice core

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Failures of the process supervisor. These never cross into the turn state
/// machine; they surface there only as a readiness flag.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch {server}: {reason}")]
    Launch { server: String, reason: String },

    #[error("port {port} for {server} is answered by something other than the expected server")]
    PortInUse { server: String, port: u16 },

    #[error("{server} exceeded its restart budget ({restarts} restarts)")]
    ServerFatal { server: String, restarts: u32 },

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("{0} was stopped before it finished starting")]
    StoppedDuringStart(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single STT / TTS / chat call.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// HTTP status for `Server` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Network and timeout failures are the only ones worth repeating with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Timeout)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::MalformedResponse(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// WAV codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("WAV data truncated: {0}")]
    Truncated(String),
}

impl From<AudioError> for ClientError {
    fn from(err: AudioError) -> Self {
        ClientError::UnsupportedFormat(err.to_string())
    }
}

/// Settings persistence and validation failures.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to save settings: {0}")]
    Save(String),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors that can occur in the voice system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("{0} timed out")]
    StageTimeout(&'static str),

    #[error("{0} was already set for this turn")]
    AlreadySet(&'static str),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
