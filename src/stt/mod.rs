//! Speech-to-text.

pub mod gateway;
pub mod transcriber;

pub use gateway::TranscriptionGateway;
pub use transcriber::{MockTranscriber, Transcriber};
