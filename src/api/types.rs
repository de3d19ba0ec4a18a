//! Wire types for the session, speech and assessment endpoints.

use crate::config::VoiceConfig;
use crate::defaults;
use serde::{Deserialize, Serialize};

/// Voice hints attached to a scenario's patient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceProfile {
    pub voice_name: Option<String>,
    pub emotional_style: Option<String>,
}

/// Parameters for one synthesis request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceParams {
    pub voice_name: Option<String>,
    pub emotional_style: String,
}

impl VoiceParams {
    /// Scenario voice first, configured voice as fallback.
    pub fn resolve(profile: &VoiceProfile, config: &VoiceConfig) -> Self {
        Self {
            voice_name: profile
                .voice_name
                .clone()
                .or_else(|| config.voice_name.clone()),
            emotional_style: profile
                .emotional_style
                .clone()
                .unwrap_or_else(|| config.emotional_style.clone()),
        }
    }
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice_name: None,
            emotional_style: defaults::EMOTIONAL_STYLE.to_string(),
        }
    }
}

/// The parts of a scenario the session client needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub scenario_id: String,
    pub title: Option<String>,
    pub opening_line: String,
    pub voice: VoiceProfile,
}

impl Scenario {
    /// Extract from the backend's scenario document.
    pub fn from_value(scenario_id: &str, value: &serde_json::Value) -> Self {
        let str_at = |pointer: &str| {
            value
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            scenario_id: str_at("/scenario_id").unwrap_or_else(|| scenario_id.to_string()),
            title: str_at("/title"),
            opening_line: str_at("/dialogue_tree/root/patient_says")
                .unwrap_or_else(|| defaults::OPENING_LINE.to_string()),
            voice: VoiceProfile {
                voice_name: str_at("/patient_profile/voice_profile/voice_id"),
                emotional_style: str_at("/patient_profile/voice_profile/emotional_state"),
            },
        }
    }
}

/// Response of the session create endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SessionCreated {
    pub session_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Result of completing a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompletionSummary {
    /// Session length in seconds, as measured by the backend
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Scored feedback for a completed session. The scoring itself is opaque;
/// the well-known fields are lifted out for display.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentReport {
    pub overall_score: Option<f64>,
    pub feedback_summary: Option<String>,
    pub strengths: Vec<String>,
    pub areas_for_improvement: Vec<String>,
    pub recommendations: Vec<String>,
    pub raw: serde_json::Value,
}

impl AssessmentReport {
    pub fn from_value(raw: serde_json::Value) -> Self {
        let strings = |key: &str| -> Vec<String> {
            raw.get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            overall_score: raw.get("overall_score").and_then(|v| v.as_f64()),
            feedback_summary: raw
                .get("feedback_summary")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            strengths: strings("strengths"),
            areas_for_improvement: strings("areas_for_improvement"),
            recommendations: strings("recommendations"),
            raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scenario_reads_opening_line_and_voice() {
        let value = json!({
            "scenario_id": "chest-pain-01",
            "title": "Chest pain",
            "dialogue_tree": {"root": {"patient_says": "Doctor, my chest hurts."}},
            "patient_profile": {"voice_profile": {"voice_id": "en-GB-RyanNeural", "emotional_state": "anxious"}}
        });
        let scenario = Scenario::from_value("ignored", &value);

        assert_eq!(scenario.scenario_id, "chest-pain-01");
        assert_eq!(scenario.opening_line, "Doctor, my chest hurts.");
        assert_eq!(scenario.voice.voice_name.as_deref(), Some("en-GB-RyanNeural"));
        assert_eq!(scenario.voice.emotional_style.as_deref(), Some("anxious"));
    }

    #[test]
    fn scenario_defaults_opening_line() {
        let scenario = Scenario::from_value("s1", &json!({"dialogue_tree": {"root": {"patient_says": "  "}}}));
        assert_eq!(scenario.scenario_id, "s1");
        assert_eq!(scenario.opening_line, "Hello, doctor.");
        assert_eq!(scenario.voice, VoiceProfile::default());
    }

    #[test]
    fn voice_params_prefer_scenario_then_config() {
        let config = VoiceConfig {
            voice_name: Some("configured".to_string()),
            emotional_style: "calm".to_string(),
        };

        let params = VoiceParams::resolve(&VoiceProfile::default(), &config);
        assert_eq!(params.voice_name.as_deref(), Some("configured"));
        assert_eq!(params.emotional_style, "calm");

        let profile = VoiceProfile {
            voice_name: Some("scenario".to_string()),
            emotional_style: Some("anxious".to_string()),
        };
        let params = VoiceParams::resolve(&profile, &config);
        assert_eq!(params.voice_name.as_deref(), Some("scenario"));
        assert_eq!(params.emotional_style, "anxious");
    }

    #[test]
    fn assessment_report_lifts_known_fields() {
        let report = AssessmentReport::from_value(json!({
            "overall_score": 78,
            "feedback_summary": "Good history taking.",
            "strengths": ["rapport"],
            "areas_for_improvement": ["red flags"],
            "recommendations": []
        }));
        assert_eq!(report.overall_score, Some(78.0));
        assert_eq!(report.strengths, vec!["rapport".to_string()]);
        assert_eq!(report.areas_for_improvement, vec!["red flags".to_string()]);
        assert!(report.recommendations.is_empty());
    }
}
