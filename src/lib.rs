//! coachsh - Practice clinical consultations with a simulated patient
//!
//! Realtime session client: a reconnecting channel to the patient simulation,
//! microphone capture and reply playback, remote transcription, and the
//! turn-taking controller that ties them together.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod api;
pub mod audio;
pub mod channel;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod output;
pub mod session;
pub mod stt;

// Composition root - needs real devices and the CLI
#[cfg(all(feature = "cpal-audio", feature = "cli"))]
pub mod app;

// Seams (transport → client → controller)
pub use api::session::SessionApi;
pub use api::speech::SpeechApi;
pub use api::transport::RequestTransport;
pub use audio::playback::Speaker;
pub use audio::recorder::Microphone;
pub use channel::transport::SocketTransport;
pub use stt::transcriber::Transcriber;

// Components
pub use audio::pipeline::{AudioPipeline, CaptureState};
pub use channel::session_channel::{ChannelState, SessionChannel};
pub use stt::gateway::TranscriptionGateway;

// Controller
pub use session::controller::{ControllerConfig, ScenarioSessionController, SessionDeps};
pub use session::types::{ControllerEvent, ControllerState, Role, TranscriptEntry};

// Error handling
pub use error::{CoachError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_hash_suffix_is_short() {
        let ver = version_string();
        if let Some((_, hash)) = ver.split_once('+') {
            assert_eq!(hash.len(), 7, "expected a 7-char git hash, got: {}", hash);
        }
    }
}
