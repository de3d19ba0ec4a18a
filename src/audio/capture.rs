//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::recorder::Microphone;
use crate::audio::wav::{downmix, resample};
use crate::error::{CoachError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL probing makes ALSA/JACK print harmless but confusing noise.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for voice input.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List usable input devices, marking PipeWire/Pulse ones as recommended.
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _ = host; // keep host alive while iterating devices
    let devices = devices.map_err(|e| CoachError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    Ok(devices
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .map(|name| {
            if is_preferred_device(&name) {
                format!("{} [recommended]", name)
            } else {
                name
            }
        })
        .collect())
}

/// Resolve the input device: by exact name, else PipeWire/Pulse, else system default.
fn find_input_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let unavailable = |device: &str| CoachError::DeviceUnavailable {
            device: device.to_string(),
        };

        let devices = host.input_devices().map_err(|e| map_access_error(e.to_string()))?;
        let devices: Vec<cpal::Device> = devices.collect();

        if let Some(name) = device_name {
            return devices
                .into_iter()
                .find(|dev| dev.name().is_ok_and(|n| n == name))
                .ok_or_else(|| unavailable(name));
        }

        if let Some(preferred) = devices
            .into_iter()
            .find(|dev| dev.name().is_ok_and(|n| is_preferred_device(&n)))
        {
            return Ok(preferred);
        }

        host.default_input_device()
            .ok_or_else(|| unavailable("default"))
    })
}

/// Backends report a refused microphone as a generic backend error; sort it out by message.
fn map_access_error(message: String) -> CoachError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        CoachError::PermissionDenied { message }
    } else {
        CoachError::AudioCapture { message }
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> CoachError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => CoachError::DeviceUnavailable {
            device: "input".to_string(),
        },
        other => map_access_error(format!("Failed to open input stream: {}", other)),
    }
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through the Mutex in CpalMicrophone,
/// and only to be dropped or paused.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone backed by a CPAL input stream.
///
/// The device is opened on `start` and released on `stop`, so the OS only
/// sees the microphone in use while a capture is running. Samples are
/// converted to mono at the configured rate inside the callback.
pub struct CpalMicrophone {
    device_name: Option<String>,
    stream: Mutex<Option<SendableStream>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    callback_count: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalMicrophone {
    /// Create a microphone for `device_name` (or the best default).
    ///
    /// No device is touched until [`Microphone::start`].
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
            stream: Mutex::new(None),
            buffer: Arc::new(Mutex::new(Vec::new())),
            callback_count: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    fn push_converted(buffer: &Mutex<Vec<i16>>, data: &[i16], channels: usize, from: u32, to: u32) {
        let mono = downmix(data, channels);
        let converted = resample(&mono, from, to);
        if let Ok(mut buf) = buffer.lock() {
            buf.extend_from_slice(&converted);
        }
    }

    /// Try i16 and f32 at the target rate/mono first, then the device's native config.
    fn build_stream(&self, device: &cpal::Device) -> Result<cpal::Stream> {
        let preferred = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let err_callback = |err| tracing::warn!("audio input stream error: {}", err);

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = device.build_input_stream(
            &preferred,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = device.build_input_stream(
            &preferred,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().map(|&s| f32_to_i16(s)));
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        self.build_native_stream(device)
    }

    /// Capture at the device's native config and convert in software.
    fn build_native_stream(&self, device: &cpal::Device) -> Result<cpal::Stream> {
        let native = device
            .default_input_config()
            .map_err(|e| map_access_error(format!("Failed to query input config: {}", e)))?;

        let channels = native.channels() as usize;
        let native_rate = native.sample_rate().0;
        let target_rate = self.sample_rate;
        let config: cpal::StreamConfig = native.clone().into();
        let err_callback = |err| tracing::warn!("audio input stream error: {}", err);

        tracing::debug!(
            channels,
            native_rate,
            format = ?native.sample_format(),
            "using native input format with software conversion"
        );

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        match native.sample_format() {
            cpal::SampleFormat::I16 => device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Self::push_converted(&buffer, data, channels, native_rate, target_rate);
                    },
                    err_callback,
                    None,
                )
                .map_err(map_build_error),
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let pcm: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                        Self::push_converted(&buffer, &pcm, channels, native_rate, target_rate);
                    },
                    err_callback,
                    None,
                )
                .map_err(map_build_error),
            other => Err(CoachError::AudioCapture {
                message: format!("Unsupported native sample format: {:?}", other),
            }),
        }
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

impl Microphone for CpalMicrophone {
    fn start(&mut self) -> Result<()> {
        let mut guard = self.stream.lock().map_err(|e| CoachError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })?;
        if guard.is_some() {
            return Ok(());
        }

        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
        self.callback_count.store(0, Ordering::Relaxed);

        let device = find_input_device(self.device_name.as_deref())?;
        let stream = self.build_stream(&device)?;
        stream
            .play()
            .map_err(|e| map_access_error(format!("Failed to start input stream: {}", e)))?;

        // Some PipeWire-ALSA setups accept non-native configs but never fire the callback.
        std::thread::sleep(Duration::from_millis(200));
        let stream = if self.callback_count.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            let native = self.build_native_stream(&device)?;
            native
                .play()
                .map_err(|e| map_access_error(format!("Failed to start input stream: {}", e)))?;
            native
        } else {
            stream
        };

        *guard = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut guard = self.stream.lock().map_err(|e| CoachError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })?;

        // Dropping the stream releases the device.
        if let Some(stream) = guard.take() {
            stream.0.pause().map_err(|e| CoachError::AudioCapture {
                message: format!("Failed to stop input stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn take_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| CoachError::AudioCapture {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
