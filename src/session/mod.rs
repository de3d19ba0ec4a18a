//! Scenario session orchestration.
//!
//! ```text
//!  SessionApi ──┐                    ┌──▶ SessionChannel (student_message ⇄ patient_response)
//!  SpeechApi  ──┼──▶ ScenarioSession ┤
//!  Transcriber ─┘     Controller     └──▶ AudioPipeline (capture / playback queue)
//!                         │
//!                         ▼
//!                  ControllerEvent stream ──▶ presentation
//! ```

pub mod controller;
pub mod types;

pub use controller::{ControllerConfig, ScenarioSessionController, SessionDeps};
pub use types::{
    ControllerEvent, ControllerState, Role, Session, SessionStatus, Transcript, TranscriptEntry,
    TurnSource,
};
