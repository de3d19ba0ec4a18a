//! Audio capture and playback for one session.
//!
//! ```text
//! Microphone ──▶ AudioPipeline::stop_capture ──▶ PayloadEncoder ──▶ AudioPayload
//!
//! AudioPayload ──▶ PlaybackQueue (one worker) ──▶ Speaker
//! ```

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod format;
pub mod pipeline;
pub mod playback;
pub mod recorder;
#[cfg(feature = "cpal-audio")]
pub mod speaker;
pub mod wav;

#[cfg(feature = "cpal-audio")]
pub use capture::CpalMicrophone;
pub use format::{AudioFormat, AudioPayload, PayloadEncoder, WavEncoder};
pub use pipeline::{AudioPipeline, CaptureState};
pub use playback::{MockSpeaker, PlaybackEvent, PlaybackQueue, Speaker};
pub use recorder::{Microphone, MockMicrophone};
#[cfg(feature = "cpal-audio")]
pub use speaker::CpalSpeaker;
