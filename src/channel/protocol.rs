//! JSON messages exchanged over the session channel.

use serde::{Deserialize, Serialize};

/// Events the client sends to the session endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// One user turn
    StudentMessage { message: String },
}

impl OutboundEvent {
    /// Serialize event to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events the session endpoint pushes to the client.
///
/// Types this client does not know deserialize to [`InboundEvent::Unknown`]
/// so they can be logged and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// The simulated patient's reply
    PatientResponse {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_base64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
    },
    /// Server-side failure for the last turn
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// Deserialize event from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn patient_response(message: impl Into<String>) -> Self {
        InboundEvent::PatientResponse {
            message: message.into(),
            audio_base64: None,
            audio_url: None,
        }
    }
}
