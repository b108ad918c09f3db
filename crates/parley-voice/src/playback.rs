//! Audio output seam for the Playing stage.

use crate::audio::AudioBuffer;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Renders synthesized speech.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `audio` at `volume` (0.0..=1.0) and return once it has finished.
    async fn play(&self, audio: AudioBuffer, volume: f32) -> VoiceResult<()>;

    /// Silence whatever is playing. Safe to call when idle.
    fn stop(&self);
}

/// How a bounded playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Cancelled,
}

/// Play a clip, giving up after its own length plus `grace`.
///
/// Cancellation and the deadline both silence the output before returning.
pub async fn play_bounded(
    output: &dyn AudioOutput,
    audio: AudioBuffer,
    volume: f32,
    grace: Duration,
    cancel: &CancellationToken,
) -> VoiceResult<PlaybackOutcome> {
    let limit = audio.duration() + grace;
    debug!(clip = ?audio.duration(), ?limit, volume, "starting playback");

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(PlaybackOutcome::Cancelled),
        result = tokio::time::timeout(limit, output.play(audio, volume)) => match result {
            Ok(Ok(())) => return Ok(PlaybackOutcome::Finished),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(?limit, "playback did not signal completion");
                Err(VoiceError::StageTimeout("playback"))
            }
        },
    };
    output.stop();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays for a fixed wall time regardless of the clip.
    struct FixedOutput {
        takes: Duration,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioOutput for FixedOutput {
        async fn play(&self, _audio: AudioBuffer, _volume: f32) -> VoiceResult<()> {
            tokio::time::sleep(self.takes).await;
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn one_second() -> AudioBuffer {
        AudioBuffer::new(vec![0.1; 16000], 16000, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn finishes_within_clip_length() {
        let output = FixedOutput {
            takes: Duration::from_millis(900),
            stops: AtomicUsize::new(0),
        };
        let outcome = play_bounded(
            &output,
            one_second(),
            1.0,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, PlaybackOutcome::Finished);
        assert_eq!(output.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_output_times_out() {
        let output = FixedOutput {
            takes: Duration::from_secs(60),
            stops: AtomicUsize::new(0),
        };
        let err = play_bounded(
            &output,
            one_second(),
            1.0,
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VoiceError::StageTimeout("playback")));
        assert_eq!(output.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_output() {
        let output = FixedOutput {
            takes: Duration::from_secs(60),
            stops: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = play_bounded(&output, one_second(), 1.0, Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PlaybackOutcome::Cancelled);
        assert_eq!(output.stops.load(Ordering::SeqCst), 1);
    }
}
