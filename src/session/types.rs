//! Session data model shared by the controller, the API layer and the UI.

use crate::audio::pipeline::CaptureState;
use crate::channel::session_channel::ChannelState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Active,
    Completed,
    Errored,
}

impl SessionStatus {
    /// Map the backend's session status strings.
    pub fn from_backend(status: &str) -> Self {
        match status {
            "in_progress" | "active" => SessionStatus::Active,
            "completed" => SessionStatus::Completed,
            "abandoned" | "errored" => SessionStatus::Errored,
            _ => SessionStatus::Initializing,
        }
    }
}

/// One scenario attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub scenario_id: String,
    pub user_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    User,
}

impl Role {
    /// Role name the session backend stores.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::User => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::User => write!(f, "user"),
        }
    }
}

/// How the user produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Typed,
    Voice,
}

/// One conversational turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub timestamp_utc: DateTime<Utc>,
    /// Where the turn's audio came from, if any (reply URL or playback id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
}

impl TranscriptEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp_utc: Utc::now(),
            audio_ref: None,
        }
    }

    pub fn with_audio_ref(mut self, audio_ref: impl Into<String>) -> Self {
        self.audio_ref = Some(audio_ref.into());
        self
    }
}

/// Append-only, ordered list of turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn and return its index.
    pub fn append(&mut self, entry: TranscriptEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }
}

/// Turn-taking state of a [`ScenarioSessionController`](crate::session::ScenarioSessionController).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Initializing,
    AwaitingUserTurn,
    AwaitingPatientTurn,
    Completed,
    Errored,
}

impl ControllerState {
    /// `Completed` and `Errored` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Completed | ControllerState::Errored)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Initializing => "initializing",
            ControllerState::AwaitingUserTurn => "awaiting user turn",
            ControllerState::AwaitingPatientTurn => "awaiting patient turn",
            ControllerState::Completed => "completed",
            ControllerState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Everything the presentation layer observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A turn was appended at `index`
    TranscriptUpdated {
        index: usize,
        entry: TranscriptEntry,
    },
    StateChanged(ControllerState),
    ChannelStateChanged(ChannelState),
    CaptureStateChanged(CaptureState),
    /// The backend reported a problem with the last turn; the session continues
    ServerError { message: String },
    /// The controller stopped for good; create a new session to continue
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_preserves_append_order() {
        let mut transcript = Transcript::new();
        assert!(transcript.is_empty());

        assert_eq!(transcript.append(TranscriptEntry::new(Role::Patient, "Hello, doctor.")), 0);
        assert_eq!(transcript.append(TranscriptEntry::new(Role::User, "What brings you in?")), 1);

        let texts: Vec<&str> = transcript.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello, doctor.", "What brings you in?"]);
        assert_eq!(transcript.last().map(|e| e.role), Some(Role::User));
    }

    #[test]
    fn backend_status_mapping() {
        assert_eq!(SessionStatus::from_backend("in_progress"), SessionStatus::Active);
        assert_eq!(SessionStatus::from_backend("completed"), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_backend("abandoned"), SessionStatus::Errored);
        assert_eq!(SessionStatus::from_backend("???"), SessionStatus::Initializing);
    }

    #[test]
    fn user_role_is_student_on_the_wire() {
        assert_eq!(Role::User.wire_name(), "student");
        assert_eq!(Role::Patient.wire_name(), "patient");
        assert_eq!(Role::User.to_string(), "user");
    }

    #[test]
    fn entry_serializes_with_utc_timestamp() {
        let entry = TranscriptEntry::new(Role::Patient, "Hi").with_audio_ref("playback:1");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["role"], "patient");
        assert_eq!(json["audio_ref"], "playback:1");
        assert!(json["timestamp_utc"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn terminal_states() {
        assert!(ControllerState::Completed.is_terminal());
        assert!(ControllerState::Errored.is_terminal());
        assert!(!ControllerState::AwaitingPatientTurn.is_terminal());
    }
}
