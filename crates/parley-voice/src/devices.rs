//! Real audio devices: CPAL capture and Rodio playback
//!
//! Neither `cpal::Stream` nor `rodio::OutputStream` may leave the thread that
//! created it, so each adapter owns a dedicated thread and talks to it over
//! channels.

use crate::audio::AudioBuffer;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioOutput;
use crate::recording::MicrophoneSource;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Default input device, mono, at a fixed sample rate.
pub struct CpalMicrophone {
    sample_rate: u32,
    /// Samples per chunk sent to the recorder.
    chunk_len: usize,
}

impl CpalMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            // 100ms chunks
            chunk_len: (sample_rate as usize / 10).max(1),
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&self) -> VoiceResult<mpsc::Receiver<Vec<f32>>> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<f32>>(64);
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let sample_rate = self.sample_rate;
        let chunk_len = self.chunk_len;

        thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, chunk_len, chunk_tx.clone()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // The stream lives until the recorder drops its receiver.
                while !chunk_tx.is_closed() {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                debug!("audio capture released");
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioDevice("capture thread exited".to_string()))??;
        Ok(chunk_rx)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        1
    }
}

fn build_input_stream(
    sample_rate: u32,
    chunk_len: usize,
    chunk_tx: mpsc::Sender<Vec<f32>>,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        sample_rate,
        "🎤 opening input device"
    );

    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };

    let mut pending = Vec::with_capacity(chunk_len);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() >= chunk_len {
                        let chunk = std::mem::replace(&mut pending, Vec::with_capacity(chunk_len));
                        if let Err(mpsc::error::TrySendError::Full(_)) = chunk_tx.try_send(chunk) {
                            warn!("recorder is behind; dropping audio chunk");
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
    stream
        .play()
        .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
    Ok(stream)
}

struct PlayRequest {
    audio: AudioBuffer,
    volume: f32,
    done: oneshot::Sender<VoiceResult<()>>,
}

/// Default output device driven from its own thread.
pub struct RodioOutput {
    requests: std_mpsc::Sender<PlayRequest>,
    stop: Arc<AtomicBool>,
}

impl RodioOutput {
    pub fn new() -> VoiceResult<Self> {
        let (requests, request_rx) = std_mpsc::channel::<PlayRequest>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::AudioDevice(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!("🔊 output device ready");

                while let Ok(request) = request_rx.recv() {
                    let result = play_to_end(&handle, request.audio, request.volume, &stop_flag);
                    if let Err(e) = &result {
                        error!(error = %e, "playback failed");
                    }
                    let _ = request.done.send(result);
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioDevice("playback thread exited".to_string()))??;
        Ok(Self { requests, stop })
    }
}

fn play_to_end(
    handle: &OutputStreamHandle,
    audio: AudioBuffer,
    volume: f32,
    stop: &AtomicBool,
) -> VoiceResult<()> {
    stop.store(false, Ordering::SeqCst);
    let sink = Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
    sink.set_volume(volume.clamp(0.0, 1.0));
    let channels = audio.channels();
    let sample_rate = audio.sample_rate();
    sink.append(SamplesBuffer::new(channels, sample_rate, audio.into_samples()));

    while !sink.empty() {
        if stop.swap(false, Ordering::SeqCst) {
            info!("🔇 playback stopped");
            sink.stop();
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn play(&self, audio: AudioBuffer, volume: f32) -> VoiceResult<()> {
        let (done, finished) = oneshot::channel();
        self.requests
            .send(PlayRequest {
                audio,
                volume,
                done,
            })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        finished
            .await
            .map_err(|_| VoiceError::Playback("playback thread exited".to_string()))?
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
