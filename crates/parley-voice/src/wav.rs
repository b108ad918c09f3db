//! Canonical 16-bit PCM WAV codec.
//!
//! The local STT/TTS servers read and write the plain 44-byte RIFF layout:
//! channels at byte 22, sample rate at 24, bits per sample at 34 and the data
//! size at 40, all little-endian.

use crate::audio::AudioBuffer;
use crate::error::AudioError;

/// Size of the canonical RIFF/WAVE header.
pub const WAV_HEADER_LEN: usize = 44;

const CHANNELS_OFFSET: usize = 22;
const SAMPLE_RATE_OFFSET: usize = 24;
const BITS_PER_SAMPLE_OFFSET: usize = 34;
const DATA_SIZE_OFFSET: usize = 40;

/// Scale between normalized floats and i16. A power of two, so a decoded
/// sample encodes back to exactly the same integer.
const PCM_SCALE: f32 = 32768.0;

/// Encode a buffer as 16-bit PCM WAV bytes. Samples are clamped to -1.0..=1.0.
pub fn encode_wav(buffer: &AudioBuffer) -> Vec<u8> {
    let channels = buffer.channels();
    let sample_rate = buffer.sample_rate();
    let data_len = (buffer.len() * 2) as u32;
    let block_align = channels * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = Vec::with_capacity(WAV_HEADER_LEN + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in buffer.samples() {
        let pcm = (s.clamp(-1.0, 1.0) * PCM_SCALE)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        buf.extend_from_slice(&pcm.to_le_bytes());
    }
    buf
}

/// Decode canonical 16-bit PCM WAV bytes.
///
/// The declared data size is honored when the body is at least that long; a
/// shorter body is decoded up to its last whole sample.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, AudioError> {
    if bytes.len() < WAV_HEADER_LEN {
        return Err(AudioError::Truncated(format!(
            "{} bytes is shorter than the {}-byte header",
            bytes.len(),
            WAV_HEADER_LEN
        )));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(AudioError::UnsupportedFormat(
            "missing RIFF/WAVE signature".to_string(),
        ));
    }

    let bits = read_u16(bytes, BITS_PER_SAMPLE_OFFSET);
    if bits != 16 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} bits per sample (expected 16)",
            bits
        )));
    }
    let channels = read_u16(bytes, CHANNELS_OFFSET);
    if channels == 0 {
        return Err(AudioError::UnsupportedFormat("zero channels".to_string()));
    }
    let sample_rate = read_u32(bytes, SAMPLE_RATE_OFFSET);
    let declared = read_u32(bytes, DATA_SIZE_OFFSET) as usize;

    let body = &bytes[WAV_HEADER_LEN..];
    let data = &body[..declared.min(body.len())];
    let samples = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM_SCALE)
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
