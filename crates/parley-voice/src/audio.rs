//! Audio buffers and the numeric side of the pipeline: silence trimming and
//! RMS-based speech detection.
//!
//! Every transform takes a buffer by reference and returns a new one, so a
//! buffer handed to another stage is never mutated underneath it.

use std::time::Duration;

/// Normalized float samples (-1.0..=1.0), interleaved when `channels > 1`.
///
/// Sample rate and channel count are fixed for the lifetime of the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// Create a buffer. A channel count of 0 is treated as mono.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// An empty buffer with the given format.
    pub fn empty(sample_rate: u32, channels: u16) -> Self {
        Self::new(Vec::new(), sample_rate, channels)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total sample count across all channels.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length of the buffer.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// A new buffer with the same format and the given samples.
    fn with_samples(&self, samples: Vec<f32>) -> Self {
        Self {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Root mean square of all samples: `sqrt(mean(sample²))`. Empty input is 0.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Drop leading and trailing samples whose magnitude does not exceed
/// `amplitude_threshold`.
///
/// The cut points are widened to whole frames so interleaved channels stay
/// aligned. If no sample exceeds the threshold the result is empty.
pub fn trim_silence(buffer: &AudioBuffer, amplitude_threshold: f32) -> AudioBuffer {
    let samples = buffer.samples();
    let loud = |s: &f32| s.abs() > amplitude_threshold;

    let (first, last) = match (samples.iter().position(loud), samples.iter().rposition(loud)) {
        (Some(first), Some(last)) => (first, last),
        _ => return buffer.with_samples(Vec::new()),
    };

    let channels = buffer.channels() as usize;
    let start = first / channels * channels;
    let end = ((last / channels + 1) * channels).min(samples.len());

    buffer.with_samples(samples[start..end].to_vec())
}

/// True when the buffer carries enough energy to be worth transcribing.
pub fn contains_speech(buffer: &AudioBuffer, min_rms: f32) -> bool {
    !buffer.is_empty() && compute_rms(buffer.samples()) >= min_rms
}
