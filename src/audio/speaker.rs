//! Speaker output using CPAL.

use crate::audio::capture::with_suppressed_stderr;
use crate::audio::format::{AudioFormat, AudioPayload};
use crate::audio::playback::Speaker;
use crate::audio::wav::{self, DecodedAudio};
use crate::error::{CoachError, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// How often the blocking playback loop checks for completion or a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Plays WAV payloads on the default output device.
///
/// Each payload opens its own output stream; the stream is dropped (and the
/// device released) as soon as the payload finishes or is stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSpeaker;

impl CpalSpeaker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Speaker for CpalSpeaker {
    async fn play(&self, payload: &AudioPayload, stop: Arc<AtomicBool>) -> Result<()> {
        if payload.format != AudioFormat::Wav {
            return Err(CoachError::AudioPlayback {
                message: format!("No local decoder for {}", payload.format),
            });
        }
        let decoded = wav::decode_wav(&payload.data)?;
        if decoded.samples.is_empty() {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || play_blocking(decoded, stop))
            .await
            .map_err(|e| CoachError::AudioPlayback {
                message: format!("Playback task failed: {}", e),
            })?
    }
}

fn play_blocking(decoded: DecodedAudio, stop: Arc<AtomicBool>) -> Result<()> {
    let device = with_suppressed_stderr(|| cpal::default_host().default_output_device())
        .ok_or_else(|| CoachError::DeviceUnavailable {
            device: "default output".to_string(),
        })?;
    let config = device
        .default_output_config()
        .map_err(|e| CoachError::AudioPlayback {
            message: format!("Failed to query output config: {}", e),
        })?;

    let channels = usize::from(config.channels());
    let output_rate = config.sample_rate().0;
    let mono = wav::resample(&decoded.to_mono(), decoded.sample_rate, output_rate);
    let total = mono.len();
    let samples: Arc<Vec<i16>> = Arc::new(mono);
    let position = Arc::new(AtomicUsize::new(0));
    let stream_config: cpal::StreamConfig = config.clone().into();
    let err_callback = |err| tracing::warn!("audio output stream error: {}", err);

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    fill_frames(data, channels, &samples, &position, 0.0, |s| {
                        s as f32 / i16::MAX as f32
                    });
                },
                err_callback,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    fill_frames(data, channels, &samples, &position, 0, |s| s);
                },
                err_callback,
                None,
            )
        }
        other => {
            return Err(CoachError::AudioPlayback {
                message: format!("Unsupported output sample format: {:?}", other),
            });
        }
    }
    .map_err(|e| CoachError::AudioPlayback {
        message: format!("Failed to open output stream: {}", e),
    })?;

    stream.play().map_err(|e| CoachError::AudioPlayback {
        message: format!("Failed to start output stream: {}", e),
    })?;

    while position.load(Ordering::Relaxed) < total {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    // Dropping the stream stops output immediately.
    drop(stream);
    Ok(())
}

/// Write the next frames of `samples` into an interleaved output buffer.
fn fill_frames<T: Copy>(
    data: &mut [T],
    channels: usize,
    samples: &[i16],
    position: &AtomicUsize,
    silence: T,
    convert: impl Fn(i16) -> T,
) {
    for frame in data.chunks_mut(channels.max(1)) {
        let index = position.fetch_add(1, Ordering::Relaxed);
        let value = samples.get(index).map_or(silence, |&s| convert(s));
        frame.fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_frames_duplicates_mono_across_channels() {
        let position = AtomicUsize::new(0);
        let mut out = [0i16; 6];
        fill_frames(&mut out, 2, &[1, 2], &position, 0, |s| s);
        assert_eq!(out, [1, 1, 2, 2, 0, 0]);
        assert_eq!(position.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn fill_frames_converts_to_float() {
        let position = AtomicUsize::new(0);
        let mut out = [0.5f32; 2];
        fill_frames(&mut out, 1, &[i16::MAX], &position, 0.0, |s| {
            s as f32 / i16::MAX as f32
        });
        assert_eq!(out, [1.0, 0.0]);
    }

    #[tokio::test]
    async fn rejects_formats_without_local_decoder() {
        let speaker = CpalSpeaker::new();
        let payload = AudioPayload::new(AudioFormat::Mp4, vec![0; 16]);
        let result = speaker.play(&payload, Arc::new(AtomicBool::new(false))).await;
        assert!(matches!(result, Err(CoachError::AudioPlayback { .. })));
    }

    #[tokio::test]
    async fn corrupt_wav_fails_before_touching_device() {
        let speaker = CpalSpeaker::new();
        let payload = AudioPayload::new(AudioFormat::Wav, b"nope".to_vec());
        let result = speaker.play(&payload, Arc::new(AtomicBool::new(false))).await;
        assert!(matches!(result, Err(CoachError::AudioPlayback { .. })));
    }
}
