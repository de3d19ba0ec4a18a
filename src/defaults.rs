//! Default configuration constants for coachsh.
//!
//! Shared by the config layer, the component configs and the CLI so that
//! every entry point agrees on the same values.

/// Default REST API base URL (session, voice and assessment endpoints).
pub const API_URL: &str = "http://localhost:8000/api/v1";

/// Default realtime endpoint base. The session channel lives at `{WS_URL}/ws/{session_id}`.
pub const WS_URL: &str = "ws://localhost:8000";

/// Timeout for a single REST request in milliseconds.
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on the initial channel handshake in milliseconds.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Base reconnect delay in milliseconds. Attempt `n` waits `n * base`.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Consecutive failed reconnects before the channel gives up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default capture sample rate in Hz.
///
/// 16kHz is what the transcription backend expects for speech.
pub const SAMPLE_RATE: u32 = 16000;

/// Opening line used when a scenario does not define one.
pub const OPENING_LINE: &str = "Hello, doctor.";

/// Emotional style sent with speech synthesis requests.
pub const EMOTIONAL_STYLE: &str = "neutral";

/// Filename stem for uploaded recordings (`recording.webm`, `recording.wav`, ...).
pub const RECORDING_FILE_STEM: &str = "recording";

/// Capacity of the controller's event broadcast buffer.
pub const EVENT_BUFFER: usize = 256;

/// Capacity of the playback event broadcast buffer.
pub const PLAYBACK_EVENT_BUFFER: usize = 64;

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "COACHSH_LOG";
