//! Session REST API: scenarios, sessions, messages, completion and assessment.

use crate::api::transport::{ApiRequest, RequestTransport};
use crate::api::types::{AssessmentReport, CompletionSummary, Scenario, SessionCreated};
use crate::audio::format::{AudioFormat, AudioPayload};
use crate::error::{CoachError, Result};
use crate::session::types::{Role, Session, SessionStatus};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Remote session lifecycle operations.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn get_scenario(&self, scenario_id: &str) -> Result<Scenario>;

    async fn create_session(&self, scenario_id: &str, user_id: &str) -> Result<Session>;

    /// Persist one turn in the backend's session record.
    async fn post_message(&self, session_id: &str, role: Role, text: &str) -> Result<()>;

    async fn complete_session(
        &self,
        session_id: &str,
        diagnosis: Option<&str>,
    ) -> Result<CompletionSummary>;

    async fn get_assessment(&self, session_id: &str) -> Result<AssessmentReport>;

    /// Download audio referenced by URL in a patient reply.
    async fn fetch_audio(&self, url: &str) -> Result<AudioPayload>;
}

/// [`SessionApi`] over any [`RequestTransport`].
pub struct RestSessionApi {
    transport: Arc<dyn RequestTransport>,
}

impl RestSessionApi {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SessionApi for RestSessionApi {
    async fn get_scenario(&self, scenario_id: &str) -> Result<Scenario> {
        let response = self
            .transport
            .execute(ApiRequest::get(format!("/scenarios/{scenario_id}")))
            .await?
            .error_for_status()?;
        let value: serde_json::Value = response.parse_json()?;
        Ok(Scenario::from_value(scenario_id, &value))
    }

    async fn create_session(&self, scenario_id: &str, user_id: &str) -> Result<Session> {
        let request = ApiRequest::post("/sessions/").with_json(json!({
            "scenario_id": scenario_id,
            "user_id": user_id,
            "student_id": user_id,
        }));
        let response = self.transport.execute(request).await?.error_for_status()?;
        let created: SessionCreated = response.parse_json()?;

        Ok(Session {
            session_id: created.session_id,
            scenario_id: scenario_id.to_string(),
            user_id: user_id.to_string(),
            status: created
                .status
                .as_deref()
                .map(SessionStatus::from_backend)
                .unwrap_or(SessionStatus::Active),
        })
    }

    async fn post_message(&self, session_id: &str, role: Role, text: &str) -> Result<()> {
        let request = ApiRequest::post(format!("/sessions/{session_id}/message")).with_json(json!({
            "role": role.wire_name(),
            "message": text,
        }));
        self.transport.execute(request).await?.error_for_status()?;
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: &str,
        diagnosis: Option<&str>,
    ) -> Result<CompletionSummary> {
        let mut request = ApiRequest::post(format!("/sessions/{session_id}/complete"));
        if let Some(diagnosis) = diagnosis.map(str::trim).filter(|d| !d.is_empty()) {
            request = request.with_query("diagnosis", diagnosis);
        }
        let response = self.transport.execute(request).await?.error_for_status()?;
        if response.body.is_empty() {
            return Ok(CompletionSummary::default());
        }
        response.parse_json()
    }

    async fn get_assessment(&self, session_id: &str) -> Result<AssessmentReport> {
        let response = self
            .transport
            .execute(ApiRequest::get(format!("/assessments/session/{session_id}")))
            .await?
            .error_for_status()?;
        Ok(AssessmentReport::from_value(response.parse_json()?))
    }

    async fn fetch_audio(&self, url: &str) -> Result<AudioPayload> {
        let response = self
            .transport
            .execute(ApiRequest::get(url))
            .await?
            .error_for_status()?;
        let format = AudioFormat::from_mime(response.content_type.as_deref().unwrap_or_default());
        Ok(AudioPayload::new(format, response.body))
    }
}

/// Which [`SessionApi`] call a [`MockSessionApi`] saw or should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOp {
    GetScenario,
    CreateSession,
    PostMessage,
    CompleteSession,
    GetAssessment,
    FetchAudio,
}

struct MockSessionState {
    opening_line: String,
    session_id: String,
    failing: HashSet<SessionOp>,
    calls: Vec<SessionOp>,
    messages: Vec<(String, Role, String)>,
    completions: Vec<(String, Option<String>)>,
    audio: HashMap<String, AudioPayload>,
    assessment: serde_json::Value,
}

/// Mock session API for testing
///
/// Clones share state so a test can inspect what the controller did.
#[derive(Clone)]
pub struct MockSessionApi {
    state: Arc<Mutex<MockSessionState>>,
    audio_gate: Option<Arc<Semaphore>>,
}

impl MockSessionApi {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockSessionState {
                opening_line: "Hello, doctor.".to_string(),
                session_id: "session-test".to_string(),
                failing: HashSet::new(),
                calls: Vec::new(),
                messages: Vec::new(),
                completions: Vec::new(),
                audio: HashMap::new(),
                assessment: json!({"overall_score": 80, "feedback_summary": "Solid history."}),
            })),
            audio_gate: None,
        }
    }

    pub fn with_opening_line(self, line: &str) -> Self {
        self.update(|s| s.opening_line = line.to_string());
        self
    }

    pub fn with_session_id(self, id: &str) -> Self {
        self.update(|s| s.session_id = id.to_string());
        self
    }

    /// Make one operation fail with `RemoteRequest { status: 500 }`.
    pub fn failing(self, op: SessionOp) -> Self {
        self.update(|s| {
            s.failing.insert(op);
        });
        self
    }

    /// Serve `payload` for `fetch_audio(url)`.
    pub fn with_audio(self, url: &str, payload: AudioPayload) -> Self {
        self.update(|s| {
            s.audio.insert(url.to_string(), payload);
        });
        self
    }

    /// Hold every `fetch_audio` until [`release_audio`](Self::release_audio).
    pub fn holding_audio(mut self) -> Self {
        self.audio_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let one held audio download finish.
    pub fn release_audio(&self) {
        if let Some(gate) = &self.audio_gate {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> Vec<SessionOp> {
        self.read(|s| s.calls.clone())
    }

    /// `(session_id, role, text)` for every persisted turn.
    pub fn messages(&self) -> Vec<(String, Role, String)> {
        self.read(|s| s.messages.clone())
    }

    /// `(session_id, diagnosis)` for every completion call.
    pub fn completions(&self) -> Vec<(String, Option<String>)> {
        self.read(|s| s.completions.clone())
    }

    fn update(&self, f: impl FnOnce(&mut MockSessionState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }

    fn read<T: Default>(&self, f: impl FnOnce(&MockSessionState) -> T) -> T {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }

    /// Record the call and fail it if configured to.
    fn enter(&self, op: SessionOp) -> Result<()> {
        let mut state = self.state.lock().map_err(|e| CoachError::Other(e.to_string()))?;
        state.calls.push(op);
        if state.failing.contains(&op) {
            return Err(CoachError::RemoteRequest {
                status: Some(500),
                message: format!("mock {:?} failure", op),
            });
        }
        Ok(())
    }
}

impl Default for MockSessionApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn get_scenario(&self, scenario_id: &str) -> Result<Scenario> {
        self.enter(SessionOp::GetScenario)?;
        let opening_line = self.read(|s| s.opening_line.clone());
        Ok(Scenario::from_value(
            scenario_id,
            &json!({"dialogue_tree": {"root": {"patient_says": opening_line}}}),
        ))
    }

    async fn create_session(&self, scenario_id: &str, user_id: &str) -> Result<Session> {
        self.enter(SessionOp::CreateSession)?;
        Ok(Session {
            session_id: self.read(|s| s.session_id.clone()),
            scenario_id: scenario_id.to_string(),
            user_id: user_id.to_string(),
            status: SessionStatus::Active,
        })
    }

    async fn post_message(&self, session_id: &str, role: Role, text: &str) -> Result<()> {
        self.enter(SessionOp::PostMessage)?;
        self.update(|s| {
            s.messages
                .push((session_id.to_string(), role, text.to_string()))
        });
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: &str,
        diagnosis: Option<&str>,
    ) -> Result<CompletionSummary> {
        self.enter(SessionOp::CompleteSession)?;
        self.update(|s| {
            s.completions
                .push((session_id.to_string(), diagnosis.map(str::to_string)))
        });
        Ok(CompletionSummary {
            duration: Some(42),
            message: Some("Session completed".to_string()),
        })
    }

    async fn get_assessment(&self, _session_id: &str) -> Result<AssessmentReport> {
        self.enter(SessionOp::GetAssessment)?;
        Ok(AssessmentReport::from_value(
            self.read(|s| s.assessment.clone()),
        ))
    }

    async fn fetch_audio(&self, url: &str) -> Result<AudioPayload> {
        self.enter(SessionOp::FetchAudio)?;
        if let Some(gate) = &self.audio_gate {
            let permit = gate.acquire().await.map_err(|e| CoachError::RemoteRequest {
                status: None,
                message: format!("mock audio gate closed: {}", e),
            })?;
            permit.forget();
        }
        self.read(|s| s.audio.get(url).cloned())
            .ok_or_else(|| CoachError::RemoteRequest {
                status: Some(404),
                message: format!("no audio at {url}"),
            })
    }
}
