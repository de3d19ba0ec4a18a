//! Microphone capture and speaker playback owned by one session.

use crate::audio::format::{AudioPayload, PayloadEncoder, WavEncoder, negotiate_encoder};
use crate::audio::playback::{PlaybackEvent, PlaybackQueue, Speaker};
use crate::audio::recorder::Microphone;
use crate::error::{CoachError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Microphone lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Stopping,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Idle => write!(f, "idle"),
            CaptureState::Recording => write!(f, "recording"),
            CaptureState::Stopping => write!(f, "stopping"),
        }
    }
}

type SharedMicrophone = Arc<Mutex<Box<dyn Microphone>>>;

/// Owns the microphone and the speaker queue for one session.
///
/// Capture transitions are compare-and-set on the `CaptureState` watch, so a
/// second `start_capture` while recording is rejected rather than coalesced.
pub struct AudioPipeline {
    microphone: SharedMicrophone,
    encoders: Vec<Arc<dyn PayloadEncoder>>,
    active_encoder: Mutex<Option<Arc<dyn PayloadEncoder>>>,
    capture_state: watch::Sender<CaptureState>,
    playback: PlaybackQueue,
    disposed: AtomicBool,
}

impl AudioPipeline {
    /// Create a pipeline. Spawns the playback worker, so a tokio runtime must be running.
    pub fn new(microphone: Box<dyn Microphone>, speaker: Arc<dyn Speaker>) -> Self {
        Self {
            microphone: Arc::new(Mutex::new(microphone)),
            encoders: vec![Arc::new(WavEncoder)],
            active_encoder: Mutex::new(None),
            capture_state: watch::Sender::new(CaptureState::Idle),
            playback: PlaybackQueue::new(speaker),
            disposed: AtomicBool::new(false),
        }
    }

    /// Register the encoders available in this build; negotiation picks among them.
    pub fn with_encoders(mut self, encoders: Vec<Arc<dyn PayloadEncoder>>) -> Self {
        self.encoders = encoders;
        self
    }

    pub fn capture_state(&self) -> CaptureState {
        *self.capture_state.borrow()
    }

    pub fn watch_capture_state(&self) -> watch::Receiver<CaptureState> {
        self.capture_state.subscribe()
    }

    pub fn playback_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.playback.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and begin buffering.
    ///
    /// # Errors
    /// `InvalidState` if a capture is already running or the pipeline is
    /// disposed; `PermissionDenied` / `DeviceUnavailable` from the device.
    pub async fn start_capture(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.transition(CaptureState::Idle, CaptureState::Recording) {
            return Err(CoachError::invalid_state(format!(
                "cannot start capture while {}",
                self.capture_state()
            )));
        }

        let encoder = negotiate_encoder(&self.encoders);
        tracing::debug!(format = %encoder.format(), "starting capture");
        if let Ok(mut active) = self.active_encoder.lock() {
            *active = Some(encoder);
        }

        let result = self.with_microphone(|mic| mic.start()).await;

        if self.is_disposed() {
            // dispose() ran while the device was opening; release it again.
            if result.is_ok() {
                let _ = self.with_microphone(|mic| mic.stop()).await;
            }
            return Err(CoachError::invalid_state("audio pipeline disposed"));
        }

        if let Err(e) = result {
            self.capture_state.send_replace(CaptureState::Idle);
            return Err(e);
        }
        Ok(())
    }

    /// Finish the capture and return the encoded recording.
    ///
    /// # Errors
    /// `InvalidState` if no capture is in progress.
    pub async fn stop_capture(&self) -> Result<AudioPayload> {
        self.ensure_live()?;
        if !self.transition(CaptureState::Recording, CaptureState::Stopping) {
            return Err(CoachError::invalid_state(format!(
                "no capture in progress (capture is {})",
                self.capture_state()
            )));
        }

        let encoder = self
            .active_encoder
            .lock()
            .ok()
            .and_then(|mut active| active.take())
            .unwrap_or_else(|| Arc::new(WavEncoder));

        let result = self
            .with_microphone(move |mic| {
                mic.stop()?;
                let samples = mic.take_samples()?;
                let data = encoder.encode(&samples, mic.sample_rate())?;
                Ok(AudioPayload::new(encoder.format(), data))
            })
            .await;

        if self.is_disposed() {
            return Err(CoachError::invalid_state("audio pipeline disposed"));
        }
        self.capture_state.send_replace(CaptureState::Idle);

        let payload = result?;
        tracing::debug!(?payload, "capture finished");
        Ok(payload)
    }

    /// Queue a payload for playback. A no-op (logged) after disposal.
    pub fn enqueue_playback(&self, payload: AudioPayload) -> Option<u64> {
        if self.is_disposed() {
            tracing::debug!(?payload, "ignoring playback after dispose");
            return None;
        }
        self.playback.enqueue(payload)
    }

    /// Stop the in-flight payload; the queue moves to the next one.
    pub fn skip_current_playback(&self) -> Option<u64> {
        self.playback.skip_current()
    }

    /// Stop capture and playback and release both devices. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("disposing audio pipeline");

        self.playback.dispose();

        if self.capture_state() != CaptureState::Idle
            && let Ok(mut mic) = self.microphone.lock()
            && let Err(e) = mic.stop()
        {
            tracing::warn!("failed to release microphone: {}", e);
        }
        self.capture_state.send_replace(CaptureState::Idle);
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(CoachError::invalid_state("audio pipeline disposed"));
        }
        Ok(())
    }

    /// Move from `from` to `to` only if currently in `from`.
    fn transition(&self, from: CaptureState, to: CaptureState) -> bool {
        self.capture_state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Device calls may block (cpal waits for the first callback), keep them off the runtime.
    async fn with_microphone<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Microphone) -> Result<T> + Send + 'static,
    {
        let microphone = Arc::clone(&self.microphone);
        tokio::task::spawn_blocking(move || {
            let mut mic = microphone.lock().map_err(|e| CoachError::AudioCapture {
                message: format!("Failed to lock microphone: {}", e),
            })?;
            f(&mut **mic)
        })
        .await
        .map_err(|e| CoachError::AudioCapture {
            message: format!("Microphone task failed: {}", e),
        })?
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}
