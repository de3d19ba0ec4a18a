use crate::defaults;
use crate::error::{CoachError, Result};
use std::sync::{Arc, Mutex};

/// Trait for microphone devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
/// The device buffers samples between `start` and `stop`; the caller drains
/// them with `take_samples` once capture has stopped.
pub trait Microphone: Send {
    /// Acquire the input device and begin buffering.
    ///
    /// # Errors
    /// `PermissionDenied` if access is refused, `DeviceUnavailable` if there is
    /// no usable input device.
    fn start(&mut self) -> Result<()>;

    /// Stop buffering and release the input device.
    fn stop(&mut self) -> Result<()>;

    /// Drain everything buffered so far as 16-bit mono PCM.
    fn take_samples(&mut self) -> Result<Vec<i16>>;

    /// Sample rate of the buffered PCM.
    fn sample_rate(&self) -> u32;
}

/// Which failure a [`MockMicrophone`] produces on `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStartFailure {
    PermissionDenied,
    NoDevice,
}

/// Mock microphone for testing
///
/// Clones share their start/stop counters so a test can keep a handle after
/// moving the mock into an [`AudioPipeline`](crate::audio::pipeline::AudioPipeline).
#[derive(Debug, Clone)]
pub struct MockMicrophone {
    samples: Vec<i16>,
    start_failure: Option<MockStartFailure>,
    active: Arc<Mutex<bool>>,
    starts: Arc<Mutex<u32>>,
    stops: Arc<Mutex<u32>>,
}

impl MockMicrophone {
    /// Create a new mock microphone yielding 100ms of silence per capture
    pub fn new() -> Self {
        Self {
            samples: vec![0i16; 1600],
            start_failure: None,
            active: Arc::new(Mutex::new(false)),
            starts: Arc::new(Mutex::new(0)),
            stops: Arc::new(Mutex::new(0)),
        }
    }

    /// Configure the samples returned by each capture
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self, failure: MockStartFailure) -> Self {
        self.start_failure = Some(failure);
        self
    }

    /// Whether the device is currently held
    pub fn is_active(&self) -> bool {
        self.active.lock().map(|a| *a).unwrap_or(false)
    }

    /// Number of successful `start` calls
    pub fn start_count(&self) -> u32 {
        self.starts.lock().map(|c| *c).unwrap_or(0)
    }

    /// Number of `stop` calls
    pub fn stop_count(&self) -> u32 {
        self.stops.lock().map(|c| *c).unwrap_or(0)
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl Microphone for MockMicrophone {
    fn start(&mut self) -> Result<()> {
        match self.start_failure {
            Some(MockStartFailure::PermissionDenied) => Err(CoachError::PermissionDenied {
                message: "mock microphone access denied".to_string(),
            }),
            Some(MockStartFailure::NoDevice) => Err(CoachError::DeviceUnavailable {
                device: "mock".to_string(),
            }),
            None => {
                if let Ok(mut active) = self.active.lock() {
                    *active = true;
                }
                if let Ok(mut starts) = self.starts.lock() {
                    *starts += 1;
                }
                Ok(())
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Ok(mut active) = self.active.lock() {
            *active = false;
        }
        if let Ok(mut stops) = self.stops.lock() {
            *stops += 1;
        }
        Ok(())
    }

    fn take_samples(&mut self) -> Result<Vec<i16>> {
        Ok(self.samples.clone())
    }

    fn sample_rate(&self) -> u32 {
        defaults::SAMPLE_RATE
    }
}
