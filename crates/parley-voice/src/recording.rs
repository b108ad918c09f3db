//! Microphone capture for the Recording stage.
//!
//! A [`MicrophoneSource`] hands out a channel of sample chunks; the channel's
//! receiver is the exclusive claim on the device, and dropping it ends the
//! capture. [`record`] drains the channel until one of the stop conditions
//! fires.

use crate::audio::{compute_rms, AudioBuffer};
use crate::error::VoiceResult;
use crate::settings::VoiceSettings;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of captured audio.
pub trait MicrophoneSource: Send + Sync {
    /// Begin capturing. Interleaved chunks arrive until the receiver is dropped.
    fn open(&self) -> VoiceResult<mpsc::Receiver<Vec<f32>>>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;
}

/// When a recording ends on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingLimits {
    pub max_duration: Duration,
    /// Chunk RMS at or below this counts as silence.
    pub silence_threshold: f32,
    /// Continuous silence that ends the recording, counted from the start or
    /// from the last loud chunk.
    pub silence_timeout: Duration,
}

impl RecordingLimits {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            max_duration: settings.max_recording(),
            silence_threshold: settings.silence_threshold,
            silence_timeout: settings.silence_timeout(),
        }
    }
}

/// Why [`record`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop request.
    Requested,
    MaxDuration,
    Silence,
    /// The device stopped delivering audio.
    SourceEnded,
    Cancelled,
}

/// Collect chunks from `chunks` until stopped, cancelled, or a limit is hit.
pub async fn record(
    chunks: &mut mpsc::Receiver<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
    limits: &RecordingLimits,
    stop: &Notify,
    cancel: &CancellationToken,
) -> (AudioBuffer, StopReason) {
    let started = Instant::now();
    let deadline = started + limits.max_duration;
    let mut silence_deadline = started + limits.silence_timeout;
    let mut samples = Vec::new();

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Cancelled,
            _ = stop.notified() => break StopReason::Requested,
            _ = sleep_until(deadline) => break StopReason::MaxDuration,
            _ = sleep_until(silence_deadline) => break StopReason::Silence,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    if compute_rms(&chunk) > limits.silence_threshold {
                        silence_deadline = Instant::now() + limits.silence_timeout;
                    }
                    samples.extend_from_slice(&chunk);
                }
                None => break StopReason::SourceEnded,
            },
        }
    };

    debug!(
        ?reason,
        samples = samples.len(),
        elapsed = ?started.elapsed(),
        "recording finished"
    );
    (AudioBuffer::new(samples, sample_rate, channels), reason)
}
