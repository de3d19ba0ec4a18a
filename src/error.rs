//! Error types for coachsh.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoachError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Realtime channel errors
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Channel is not connected (state: {state})")]
    NotConnected { state: String },

    #[error("Channel protocol error: {message}")]
    Protocol { message: String },

    // Microphone / speaker errors
    #[error("Microphone permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Audio device unavailable: {device}")]
    DeviceUnavailable { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio encoding failed: {message}")]
    AudioEncoding { message: String },

    #[error("Audio playback failed: {message}")]
    AudioPlayback { message: String },

    // Remote services
    #[error("Transcription failed{}: {message}", status_suffix(.status))]
    Transcription {
        status: Option<u16>,
        message: String,
    },

    #[error("Remote request failed{}: {message}", status_suffix(.status))]
    RemoteRequest {
        status: Option<u16>,
        message: String,
    },

    // Illegal action for the current capture or controller state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl CoachError {
    /// Shorthand for [`CoachError::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        CoachError::InvalidState {
            message: message.into(),
        }
    }

    /// Remote HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            CoachError::Transcription { status, .. } | CoachError::RemoteRequest { status, .. } => {
                *status
            }
            _ => None,
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, CoachError>;
