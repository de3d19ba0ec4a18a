//! Turn-taking state machine for one scenario attempt.
//!
//! ```text
//! Initializing ──▶ AwaitingUserTurn ◀──▶ AwaitingPatientTurn
//!       │                 │                     │
//!       └─────────────────┴──────── end ────────┴──▶ Completed
//!              (any failure) ──▶ Errored
//! ```
//!
//! All mutable state lives in one `Core` behind a std mutex that is never
//! held across an `.await`. Inbound channel events go through one ordered
//! queue drained by a single task, so transcript order is arrival order.

use crate::api::session::SessionApi;
use crate::api::speech::SpeechApi;
use crate::api::types::{AssessmentReport, CompletionSummary, Scenario, VoiceParams};
use crate::audio::format::{AudioFormat, AudioPayload};
use crate::audio::pipeline::{AudioPipeline, CaptureState};
use crate::channel::protocol::{InboundEvent, OutboundEvent};
use crate::channel::session_channel::{ChannelClosed, ChannelState, SessionChannel};
use crate::config::VoiceConfig;
use crate::defaults;
use crate::error::{CoachError, Result};
use crate::session::types::{
    ControllerEvent, ControllerState, Role, Session, SessionStatus, Transcript, TranscriptEntry,
    TurnSource,
};
use crate::stt::transcriber::Transcriber;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Collaborators owned by one controller.
pub struct SessionDeps {
    pub session_api: Arc<dyn SessionApi>,
    pub speech_api: Arc<dyn SpeechApi>,
    pub transcriber: Arc<dyn Transcriber>,
    pub channel: SessionChannel,
    pub audio: AudioPipeline,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Give up on a patient reply after this long. `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
    pub voice: VoiceConfig,
}

/// Items the inbound processor handles, in arrival order.
enum Inbound {
    Event(InboundEvent),
    Closed(ChannelClosed),
}

/// Which phase of a user turn currently holds the turn guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnGuard {
    Sending,
    Recording,
    Transcribing,
}

impl TurnGuard {
    /// The phase a turn must be in when its text is committed.
    fn committing(source: TurnSource) -> Self {
        match source {
            TurnSource::Typed => TurnGuard::Sending,
            TurnSource::Voice => TurnGuard::Transcribing,
        }
    }
}

struct Core {
    state: ControllerState,
    initialize_started: bool,
    session: Option<Session>,
    scenario: Option<Scenario>,
    transcript: Transcript,
    /// A user turn is being acquired (typed send or capture/transcription)
    turn_in_progress: Option<TurnGuard>,
    /// Bumped on every patient reply; stale reply timers compare against it
    reply_generation: u64,
    summary: Option<CompletionSummary>,
}

struct Inner {
    session_api: Arc<dyn SessionApi>,
    speech_api: Arc<dyn SpeechApi>,
    transcriber: Arc<dyn Transcriber>,
    channel: SessionChannel,
    audio: AudioPipeline,
    config: ControllerConfig,
    core: Mutex<Core>,
    events: broadcast::Sender<ControllerEvent>,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Orchestrates one scenario attempt: session, channel, audio and transcription.
pub struct ScenarioSessionController {
    inner: Arc<Inner>,
}

impl ScenarioSessionController {
    pub fn new(deps: SessionDeps, config: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(defaults::EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                session_api: deps.session_api,
                speech_api: deps.speech_api,
                transcriber: deps.transcriber,
                channel: deps.channel,
                audio: deps.audio,
                config,
                core: Mutex::new(Core {
                    state: ControllerState::Initializing,
                    initialize_started: false,
                    session: None,
                    scenario: None,
                    transcript: Transcript::new(),
                    turn_in_progress: None,
                    reply_generation: 0,
                    summary: None,
                }),
                events,
                disposed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Observe transcript, state, channel and capture changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.inner.core().state
    }

    /// Snapshot of the transcript so far.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.inner.core().transcript.entries().to_vec()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.core().session.clone()
    }

    pub fn scenario(&self) -> Option<Scenario> {
        self.inner.core().scenario.clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    pub fn capture_state(&self) -> CaptureState {
        self.inner.audio.capture_state()
    }

    /// Fetch the scenario, create the session, open the channel and queue the
    /// opening line. Any failure leaves the controller `Errored`.
    pub async fn initialize(&self, scenario_id: &str, user_id: &str) -> Result<Session> {
        let inner = &self.inner;
        inner.ensure_live()?;
        {
            let mut core = inner.core();
            if core.state != ControllerState::Initializing || core.initialize_started {
                return Err(CoachError::invalid_state(format!(
                    "cannot initialize while {}",
                    core.state
                )));
            }
            core.initialize_started = true;
        }
        tracing::debug!(scenario_id, user_id, "initializing scenario session");

        let scenario = inner.session_api.get_scenario(scenario_id).await;
        inner.ensure_initializing()?;
        let scenario = scenario.inspect_err(|e| inner.fail(format!("Could not load scenario: {e}")))?;

        let session = inner.session_api.create_session(scenario_id, user_id).await;
        inner.ensure_initializing()?;
        let session =
            session.inspect_err(|e| inner.fail(format!("Could not create session: {e}")))?;

        {
            let mut core = inner.core();
            core.scenario = Some(scenario.clone());
            core.session = Some(session.clone());
        }

        // Subscribe before opening so nothing that arrives early is lost;
        // the processor starts once the opening line is in the transcript.
        let (tx, rx) = mpsc::unbounded_channel();
        let events_tx = tx.clone();
        let _events = inner.channel.subscribe(move |event| {
            let _ = events_tx.send(Inbound::Event(event.clone()));
        });
        let _close = inner.channel.on_close(move |closed| {
            let _ = tx.send(Inbound::Closed(closed.clone()));
        });
        Inner::spawn_forwarders(inner);

        let opened = inner.channel.open(&session.session_id).await;
        inner.ensure_initializing()?;
        opened.inspect_err(|e| inner.fail(format!("Could not connect to session: {e}")))?;

        let opening = TranscriptEntry::new(Role::Patient, scenario.opening_line.clone());
        inner.append(opening);

        let voice = VoiceParams::resolve(&scenario.voice, &inner.config.voice);
        let audio = inner.speech_api.synthesize(&scenario.opening_line, &voice).await;
        inner.ensure_initializing()?;
        match audio {
            Ok(payload) => {
                inner.audio.enqueue_playback(payload);
            }
            Err(e) => tracing::warn!("opening line audio unavailable: {}", e),
        }

        Inner::spawn_processor(inner, rx);

        {
            let mut core = inner.core();
            if core.state != ControllerState::Initializing {
                return Err(CoachError::invalid_state("session ended during initialization"));
            }
            core.state = ControllerState::AwaitingUserTurn;
        }
        inner.emit(ControllerEvent::StateChanged(ControllerState::AwaitingUserTurn));
        tracing::debug!(session_id = %session.session_id, "scenario session ready");
        Ok(session)
    }

    /// Submit a typed user turn.
    ///
    /// # Errors
    /// `InvalidState` if it is not the user's turn, the text is blank, or a
    /// voice turn is being captured or transcribed. `NotConnected` if the
    /// channel is not open; nothing is appended in that case.
    pub async fn submit_text(&self, text: &str) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(CoachError::invalid_state("cannot submit an empty message"));
        }
        inner.begin_turn(TurnSource::Typed)?;
        inner.commit_user_turn(text.to_string(), TurnSource::Typed).await
    }

    /// Start recording a voice turn.
    pub async fn start_capture(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.begin_turn(TurnSource::Voice)?;

        let started = inner.audio.start_capture().await;
        if inner.is_disposed() {
            return Err(CoachError::invalid_state("controller disposed"));
        }
        started.inspect_err(|e| {
            tracing::warn!("could not start capture: {}", e);
            inner.end_turn();
        })
    }

    /// Stop recording, transcribe, and submit the text as the user's turn.
    ///
    /// Returns the submitted text. A failed transcription is returned to the
    /// caller and the user may try again; nothing is appended.
    pub async fn stop_capture(&self) -> Result<String> {
        let inner = &self.inner;
        inner.ensure_live()?;
        inner.claim_transcription()?;

        let payload = inner.audio.stop_capture().await;
        inner.ensure_live()?;
        let payload = payload.inspect_err(|_| inner.end_turn())?;

        let text = inner.transcriber.transcribe(&payload).await;
        inner.ensure_live()?;
        let text = match text {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                inner.end_turn();
                return Err(CoachError::Transcription {
                    status: None,
                    message: "No speech recognized".to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(transcriber = inner.transcriber.name(), "transcription failed: {}", e);
                inner.end_turn();
                return Err(e);
            }
        };

        inner.commit_user_turn(text.clone(), TurnSource::Voice).await?;
        Ok(text)
    }

    /// Stop the patient audio currently playing.
    pub fn skip_playback(&self) -> Option<u64> {
        self.inner.audio.skip_current_playback()
    }

    /// End the scenario: tear down channel and audio, then complete the
    /// session remotely.
    pub async fn end_scenario(&self, diagnosis: Option<&str>) -> Result<CompletionSummary> {
        let inner = &self.inner;
        inner.ensure_live()?;

        let (previous, session) = {
            let mut core = inner.core();
            let previous = core.state;
            if previous == ControllerState::Completed {
                return Err(CoachError::invalid_state("scenario already completed"));
            }
            if previous != ControllerState::Errored {
                core.state = ControllerState::Completed;
                core.turn_in_progress = None;
                if let Some(session) = core.session.as_mut() {
                    session.status = SessionStatus::Completed;
                }
            }
            (previous, core.session.clone())
        };

        inner.teardown();
        if previous == ControllerState::Errored {
            return Err(CoachError::invalid_state(
                "session errored; start a new session instead",
            ));
        }
        inner.emit(ControllerEvent::StateChanged(ControllerState::Completed));

        let Some(session) = session else {
            return Ok(CompletionSummary::default());
        };
        let summary = inner
            .session_api
            .complete_session(&session.session_id, diagnosis)
            .await?;
        if !inner.is_disposed() {
            inner.core().summary = Some(summary.clone());
        }
        tracing::debug!(session_id = %session.session_id, ?summary, "scenario completed");
        Ok(summary)
    }

    /// Completion result, once `end_scenario` succeeded.
    pub fn summary(&self) -> Option<CompletionSummary> {
        self.inner.core().summary.clone()
    }

    /// Scored feedback for a completed scenario.
    pub async fn fetch_report(&self) -> Result<AssessmentReport> {
        let session_id = {
            let core = self.inner.core();
            if core.state != ControllerState::Completed {
                return Err(CoachError::invalid_state(format!(
                    "report is only available once completed (currently {})",
                    core.state
                )));
            }
            core.session
                .as_ref()
                .map(|s| s.session_id.clone())
                .ok_or_else(|| CoachError::invalid_state("no session was created"))?
        };
        self.inner.session_api.get_assessment(&session_id).await
    }

    /// Release everything. In-flight operations finish without touching state.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("disposing scenario session controller");
        self.inner.teardown();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl Drop for ScenarioSessionController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(CoachError::invalid_state("controller disposed"));
        }
        Ok(())
    }

    /// After each await during initialization: bail out quietly if the
    /// controller was disposed or ended meanwhile.
    fn ensure_initializing(&self) -> Result<()> {
        self.ensure_live()?;
        let state = self.core().state;
        if state != ControllerState::Initializing {
            return Err(CoachError::invalid_state(format!(
                "initialization interrupted ({state})"
            )));
        }
        Ok(())
    }

    fn emit(&self, event: ControllerEvent) {
        if !self.is_disposed() {
            let _ = self.events.send(event);
        }
    }

    fn append(&self, entry: TranscriptEntry) {
        let index = self.core().transcript.append(entry.clone());
        self.emit(ControllerEvent::TranscriptUpdated { index, entry });
    }

    fn begin_turn(&self, source: TurnSource) -> Result<()> {
        let guard = match source {
            TurnSource::Typed => TurnGuard::Sending,
            TurnSource::Voice => TurnGuard::Recording,
        };
        let mut core = self.core();
        if core.state != ControllerState::AwaitingUserTurn {
            return Err(CoachError::invalid_state(format!(
                "not the user's turn ({})",
                core.state
            )));
        }
        if let Some(active) = core.turn_in_progress {
            let what = match active {
                TurnGuard::Sending => "a message is already being sent",
                TurnGuard::Recording => "a voice turn is being recorded",
                TurnGuard::Transcribing => "a voice turn is being transcribed",
            };
            return Err(CoachError::invalid_state(what));
        }
        core.turn_in_progress = Some(guard);
        Ok(())
    }

    /// Move a recording turn to transcribing. Only the caller that wins this
    /// transition may stop the capture or release the guard.
    fn claim_transcription(&self) -> Result<()> {
        let mut core = self.core();
        match core.turn_in_progress {
            Some(TurnGuard::Recording) => {
                core.turn_in_progress = Some(TurnGuard::Transcribing);
                Ok(())
            }
            Some(TurnGuard::Transcribing) => Err(CoachError::invalid_state(
                "voice turn is already being transcribed",
            )),
            _ => Err(CoachError::invalid_state("no voice capture in progress")),
        }
    }

    fn end_turn(&self) {
        if !self.is_disposed() {
            self.core().turn_in_progress = None;
        }
    }

    /// Append the user's turn, persist it, then send it over the channel.
    async fn commit_user_turn(self: &Arc<Self>, text: String, source: TurnSource) -> Result<()> {
        let state = self.channel.state();
        if state != ChannelState::Open {
            self.end_turn();
            return Err(CoachError::NotConnected {
                state: state.to_string(),
            });
        }

        let (index, entry, session_id, generation) = {
            let mut core = self.core();
            if core.state != ControllerState::AwaitingUserTurn
                || core.turn_in_progress != Some(TurnGuard::committing(source))
            {
                return Err(CoachError::invalid_state("turn was cancelled"));
            }
            let entry = TranscriptEntry::new(Role::User, text.clone());
            let index = core.transcript.append(entry.clone());
            core.state = ControllerState::AwaitingPatientTurn;
            core.turn_in_progress = None;
            core.reply_generation += 1;
            let session_id = core
                .session
                .as_ref()
                .map(|s| s.session_id.clone())
                .unwrap_or_default();
            (index, entry, session_id, core.reply_generation)
        };
        self.emit(ControllerEvent::TranscriptUpdated { index, entry });
        self.emit(ControllerEvent::StateChanged(ControllerState::AwaitingPatientTurn));
        tracing::debug!(?source, index, "user turn appended");

        if let Err(e) = self.session_api.post_message(&session_id, Role::User, &text).await {
            tracing::warn!("could not persist user turn: {}", e);
        }
        self.ensure_live()?;

        let sent = self
            .channel
            .send(&OutboundEvent::StudentMessage { message: text })
            .await;
        self.ensure_live()?;
        if let Err(e) = sent {
            self.fail(format!("Could not deliver message: {e}"));
            return Err(e);
        }

        if let Some(timeout) = self.config.reply_timeout {
            self.spawn_reply_timer(timeout, generation);
        }
        Ok(())
    }

    /// Move to `Errored` and tear down. First failure wins.
    fn fail(&self, message: String) {
        if self.is_disposed() {
            return;
        }
        {
            let mut core = self.core();
            if core.state.is_terminal() {
                return;
            }
            core.state = ControllerState::Errored;
            core.turn_in_progress = None;
            if let Some(session) = core.session.as_mut() {
                session.status = SessionStatus::Errored;
            }
        }
        tracing::error!("scenario session failed: {}", message);
        self.emit(ControllerEvent::StateChanged(ControllerState::Errored));
        self.emit(ControllerEvent::Error { message });
        self.teardown();
    }

    fn teardown(&self) {
        self.channel.close();
        self.audio.dispose();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    /// Forward channel and capture state changes as controller events.
    fn spawn_forwarders(inner: &Arc<Self>) {
        let mut channel_rx = inner.channel.watch_state();
        let weak = Arc::downgrade(inner);
        inner.track(tokio::spawn(async move {
            while channel_rx.changed().await.is_ok() {
                let state = *channel_rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                inner.emit(ControllerEvent::ChannelStateChanged(state));
            }
        }));

        let mut capture_rx = inner.audio.watch_capture_state();
        let weak = Arc::downgrade(inner);
        inner.track(tokio::spawn(async move {
            while capture_rx.changed().await.is_ok() {
                let state = *capture_rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                inner.emit(ControllerEvent::CaptureStateChanged(state));
            }
        }));
    }

    fn spawn_processor(inner: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        inner.track(tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_disposed() {
                    break;
                }
                match item {
                    Inbound::Event(event) => inner.handle_event(event).await,
                    Inbound::Closed(closed) => inner.fail(format!(
                        "Connection lost after {} reconnect attempts: {}",
                        closed.attempts, closed.reason
                    )),
                }
            }
        }));
    }

    fn spawn_reply_timer(self: &Arc<Self>, timeout: Duration, generation: u64) {
        let weak = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let expired = {
                let core = inner.core();
                core.state == ControllerState::AwaitingPatientTurn
                    && core.reply_generation == generation
            };
            if expired {
                inner.fail(format!(
                    "No patient reply within {}s",
                    timeout.as_secs_f32()
                ));
            }
        }));
    }

    async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::PatientResponse {
                message,
                audio_base64,
                audio_url,
            } => self.handle_patient_reply(message, audio_base64, audio_url).await,
            InboundEvent::Error { message } => {
                tracing::warn!("server reported an error: {}", message);
                {
                    let mut core = self.core();
                    if core.state == ControllerState::AwaitingPatientTurn {
                        core.state = ControllerState::AwaitingUserTurn;
                        core.reply_generation += 1;
                    }
                }
                self.emit(ControllerEvent::ServerError { message });
                self.emit(ControllerEvent::StateChanged(self.core().state));
            }
            InboundEvent::Unknown => {
                tracing::debug!("ignoring inbound event of unknown type");
            }
        }
    }

    async fn handle_patient_reply(
        &self,
        message: String,
        audio_base64: Option<String>,
        audio_url: Option<String>,
    ) {
        let mut entry = TranscriptEntry::new(Role::Patient, message);
        if let Some(url) = &audio_url {
            entry = entry.with_audio_ref(url.clone());
        }

        let appended = {
            let mut core = self.core();
            if core.state.is_terminal() {
                None
            } else {
                let index = core.transcript.append(entry.clone());
                let was_waiting = core.state == ControllerState::AwaitingPatientTurn;
                if was_waiting {
                    core.state = ControllerState::AwaitingUserTurn;
                }
                core.reply_generation += 1;
                Some((index, was_waiting))
            }
        };
        let Some((index, was_waiting)) = appended else {
            tracing::debug!("ignoring patient reply after the session ended");
            return;
        };

        self.emit(ControllerEvent::TranscriptUpdated { index, entry });
        if was_waiting {
            self.emit(ControllerEvent::StateChanged(ControllerState::AwaitingUserTurn));
        }

        let payload = match (audio_base64, audio_url) {
            (Some(encoded), _) => match BASE64.decode(encoded.trim()) {
                Ok(data) if !data.is_empty() => Some(AudioPayload::new(AudioFormat::Wav, data)),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("discarding undecodable reply audio: {}", e);
                    None
                }
            },
            (None, Some(url)) => match self.session_api.fetch_audio(&url).await {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(url = %url, "could not fetch reply audio: {}", e);
                    None
                }
            },
            (None, None) => None,
        };

        if let Some(payload) = payload
            && !self.is_disposed()
        {
            self.audio.enqueue_playback(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::session::{MockSessionApi, SessionOp};
    use crate::api::speech::MockSpeechApi;
    use crate::audio::playback::{MockSpeaker, PlaybackEvent};
    use crate::audio::recorder::{MockMicrophone, MockStartFailure};
    use crate::audio::wav;
    use crate::channel::transport::{MockConnect, MockSocketTransport};
    use crate::config::ChannelSettings;
    use crate::stt::transcriber::MockTranscriber;
    use serde_json::json;

    struct Harness {
        controller: ScenarioSessionController,
        socket: MockSocketTransport,
        api: MockSessionApi,
        speech: MockSpeechApi,
        transcriber: MockTranscriber,
        mic: MockMicrophone,
        events: broadcast::Receiver<ControllerEvent>,
    }

    fn harness_with(
        socket: MockSocketTransport,
        api: MockSessionApi,
        transcriber: MockTranscriber,
        mic: MockMicrophone,
        config: ControllerConfig,
    ) -> Harness {
        let speech = MockSpeechApi::new();
        let channel = SessionChannel::new(
            Arc::new(socket.clone()),
            "ws://test",
            ChannelSettings {
                handshake_timeout_ms: 1000,
                reconnect_base_delay_ms: 100,
                max_reconnect_attempts: 2,
            },
        );
        let audio = AudioPipeline::new(
            Box::new(mic.clone()),
            Arc::new(MockSpeaker::new(Duration::from_millis(5))),
        );
        let controller = ScenarioSessionController::new(
            SessionDeps {
                session_api: Arc::new(api.clone()),
                speech_api: Arc::new(speech.clone()),
                transcriber: Arc::new(transcriber.clone()),
                channel,
                audio,
            },
            config,
        );
        let events = controller.subscribe();
        Harness {
            controller,
            socket,
            api,
            speech,
            transcriber,
            mic,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        )
    }

    async fn ready(h: &Harness) {
        h.controller.initialize("chest-pain", "42").await.unwrap();
        assert_eq!(h.controller.state(), ControllerState::AwaitingUserTurn);
    }

    async fn wait_for_state(h: &mut Harness, want: ControllerState) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while h.controller.state() != want {
                match h.events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for controller state");
    }

    fn texts(h: &Harness) -> Vec<(Role, String)> {
        h.controller
            .transcript()
            .into_iter()
            .map(|e| (e.role, e.text))
            .collect()
    }

    #[tokio::test]
    async fn initialize_appends_opening_line_and_plays_it() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new().with_opening_line("My chest hurts."),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );

        let session = h.controller.initialize("chest-pain", "42").await.unwrap();

        assert_eq!(session.session_id, "session-test");
        assert_eq!(texts(&h), vec![(Role::Patient, "My chest hurts.".to_string())]);
        assert_eq!(h.controller.channel_state(), ChannelState::Open);
        assert_eq!(h.socket.urls(), vec!["ws://test/ws/session-test".to_string()]);
        assert_eq!(h.speech.requests()[0].0, "My chest hurts.");
        assert_eq!(
            h.api.calls(),
            vec![SessionOp::GetScenario, SessionOp::CreateSession]
        );
    }

    #[tokio::test]
    async fn initialize_failure_is_terminal_error() {
        let mut h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new().failing(SessionOp::CreateSession),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );

        let result = h.controller.initialize("chest-pain", "42").await;
        assert!(matches!(result, Err(CoachError::RemoteRequest { .. })));
        assert_eq!(h.controller.state(), ControllerState::Errored);
        assert!(h.controller.transcript().is_empty());

        let mut errors = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, ControllerEvent::Error { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert!(matches!(
            h.controller.submit_text("hello").await,
            Err(CoachError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn channel_open_failure_is_terminal_error() {
        let h = harness_with(
            MockSocketTransport::new().with_script([MockConnect::Refuse]),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        assert!(matches!(
            h.controller.initialize("s", "u").await,
            Err(CoachError::Connection { .. })
        ));
        assert_eq!(h.controller.state(), ControllerState::Errored);
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() {
        let h = harness();
        ready(&h).await;
        assert!(matches!(
            h.controller.initialize("s", "u").await,
            Err(CoachError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn typed_turn_is_appended_persisted_then_sent() {
        let mut h = harness();
        ready(&h).await;

        h.controller.submit_text("  I have chest pain ").await.unwrap();

        assert_eq!(h.controller.state(), ControllerState::AwaitingPatientTurn);
        assert_eq!(
            h.socket.sent_json(),
            vec![json!({"type": "student_message", "message": "I have chest pain"})]
        );
        assert_eq!(
            h.api.messages(),
            vec![(
                "session-test".to_string(),
                Role::User,
                "I have chest pain".to_string()
            )]
        );

        h.socket.push_json(json!({"type": "patient_response", "message": "It started two days ago."}));
        wait_for_state(&mut h, ControllerState::AwaitingUserTurn).await;

        assert_eq!(
            texts(&h),
            vec![
                (Role::Patient, "Hello, doctor.".to_string()),
                (Role::User, "I have chest pain".to_string()),
                (Role::Patient, "It started two days ago.".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn blank_text_and_wrong_turn_are_rejected() {
        let h = harness();
        ready(&h).await;

        assert!(matches!(
            h.controller.submit_text("   ").await,
            Err(CoachError::InvalidState { .. })
        ));

        h.controller.submit_text("first").await.unwrap();
        assert!(matches!(
            h.controller.submit_text("second").await,
            Err(CoachError::InvalidState { .. })
        ));
        assert_eq!(h.socket.sent().len(), 1);
        assert_eq!(h.controller.transcript().len(), 2);
    }

    #[tokio::test]
    async fn typed_text_rejected_while_recording() {
        let h = harness();
        ready(&h).await;

        h.controller.start_capture().await.unwrap();
        assert!(matches!(
            h.controller.submit_text("typed").await,
            Err(CoachError::InvalidState { .. })
        ));
        assert!(matches!(
            h.controller.start_capture().await,
            Err(CoachError::InvalidState { .. })
        ));
        assert_eq!(h.mic.start_count(), 1);
        assert_eq!(h.controller.transcript().len(), 1);
    }

    #[tokio::test]
    async fn voice_turn_submits_transcribed_text_once() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new().with_response("chest pain for two days"),
            MockMicrophone::new().with_samples(vec![100; 1600]),
            ControllerConfig::default(),
        );
        ready(&h).await;

        h.controller.start_capture().await.unwrap();
        assert_eq!(h.controller.capture_state(), CaptureState::Recording);
        let text = h.controller.stop_capture().await.unwrap();

        assert_eq!(text, "chest pain for two days");
        assert_eq!(h.transcriber.call_count(), 1);
        assert_eq!(
            h.socket.sent_json(),
            vec![json!({"type": "student_message", "message": "chest pain for two days"})]
        );
        let users: Vec<_> = texts(&h).into_iter().filter(|(r, _)| *r == Role::User).collect();
        assert_eq!(users, vec![(Role::User, "chest pain for two days".to_string())]);
        assert!(!h.mic.is_active());
    }

    #[tokio::test]
    async fn transcription_failure_is_returned_and_turn_can_be_retried() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new().with_failure(Some(500)),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;

        h.controller.start_capture().await.unwrap();
        match h.controller.stop_capture().await {
            Err(CoachError::Transcription { status, .. }) => assert_eq!(status, Some(500)),
            other => panic!("Expected Transcription error, got: {:?}", other),
        }
        assert_eq!(h.controller.state(), ControllerState::AwaitingUserTurn);
        assert_eq!(h.controller.transcript().len(), 1);

        h.controller.submit_text("typed instead").await.unwrap();
        assert_eq!(h.socket.sent().len(), 1);
    }

    #[tokio::test]
    async fn permission_denied_leaves_turn_open() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new().with_start_failure(MockStartFailure::PermissionDenied),
            ControllerConfig::default(),
        );
        ready(&h).await;

        assert!(matches!(
            h.controller.start_capture().await,
            Err(CoachError::PermissionDenied { .. })
        ));
        assert_eq!(h.controller.state(), ControllerState::AwaitingUserTurn);
        h.controller.submit_text("typing works").await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_capture_is_invalid() {
        let h = harness();
        ready(&h).await;
        assert!(matches!(
            h.controller.stop_capture().await,
            Err(CoachError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn dispose_during_transcription_never_appends() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new().with_response("too late").held(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;
        h.controller.start_capture().await.unwrap();

        let controller = Arc::new(h.controller);
        let stopping = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.stop_capture().await })
        };
        h.transcriber.wait_started().await;

        controller.dispose();
        h.transcriber.release();

        assert!(matches!(
            stopping.await.unwrap(),
            Err(CoachError::InvalidState { .. })
        ));
        assert_eq!(controller.transcript().len(), 1);
        assert!(h.socket.sent().is_empty());
    }

    #[tokio::test]
    async fn second_stop_is_rejected_while_transcribing() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new().with_response("pain since Tuesday").held(),
            MockMicrophone::new().with_samples(vec![100; 1600]),
            ControllerConfig::default(),
        );
        ready(&h).await;
        h.controller.start_capture().await.unwrap();

        let controller = Arc::new(h.controller);
        let stopping = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.stop_capture().await })
        };
        h.transcriber.wait_started().await;

        // The in-flight transcription keeps the turn.
        assert!(matches!(
            controller.stop_capture().await,
            Err(CoachError::InvalidState { .. })
        ));
        assert!(matches!(
            controller.submit_text("typed while transcribing").await,
            Err(CoachError::InvalidState { .. })
        ));
        assert!(matches!(
            controller.start_capture().await,
            Err(CoachError::InvalidState { .. })
        ));

        h.transcriber.release();
        assert_eq!(stopping.await.unwrap().unwrap(), "pain since Tuesday");
        assert_eq!(h.transcriber.call_count(), 1);
        assert_eq!(
            controller
                .transcript()
                .into_iter()
                .map(|e| e.text)
                .collect::<Vec<_>>(),
            vec!["Hello, doctor.".to_string(), "pain since Tuesday".to_string()]
        );
        assert_eq!(
            h.socket.sent_json(),
            vec![json!({"type": "student_message", "message": "pain since Tuesday"})]
        );
    }

    #[tokio::test]
    async fn slow_reply_audio_does_not_reorder_later_replies() {
        let audio = wav::encode_wav(&[9; 8], 16000).unwrap();
        let mut h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new()
                .with_audio(
                    "https://cdn.test/slow.wav",
                    AudioPayload::new(AudioFormat::Wav, audio),
                )
                .holding_audio(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;
        let mut playback = h.controller.inner.audio.playback_events();
        h.controller.submit_text("hello").await.unwrap();

        h.socket.push_json(json!({
            "type": "patient_response",
            "message": "First, with audio.",
            "audio_url": "https://cdn.test/slow.wav",
        }));
        h.socket.push_json(json!({
            "type": "patient_response",
            "message": "Second, text only.",
        }));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.api.calls().contains(&SessionOp::FetchAudio) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // First reply is appended, its audio is not queued yet, and the
        // second reply waits behind it.
        assert_eq!(h.controller.transcript().len(), 3);
        assert_eq!(h.controller.transcript()[2].text, "First, with audio.");
        while let Ok(event) = playback.try_recv() {
            assert!(
                !matches!(event, PlaybackEvent::Started { id: 2 }),
                "reply audio queued before its download finished"
            );
        }

        h.api.release_audio();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.controller.transcript().len() < 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            texts(&h)[2..].to_vec(),
            vec![
                (Role::Patient, "First, with audio.".to_string()),
                (Role::Patient, "Second, text only.".to_string()),
            ]
        );
        let mut patient_updates = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let ControllerEvent::TranscriptUpdated { index, entry } = event
                && entry.role == Role::Patient
                && index >= 2
            {
                patient_updates.push((index, entry.text));
            }
        }
        assert_eq!(
            patient_updates,
            vec![
                (2, "First, with audio.".to_string()),
                (3, "Second, text only.".to_string()),
            ]
        );
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), playback.recv())
                .await
                .unwrap()
                .unwrap();
            if event == (PlaybackEvent::Started { id: 2 }) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn not_connected_rejects_without_append() {
        let h = harness_with(
            MockSocketTransport::new().with_script([MockConnect::Accept, MockConnect::Hang]),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;
        let mut channel_state = {
            h.socket.drop_connection();
            h.controller.inner.channel.watch_state()
        };
        channel_state
            .wait_for(|s| *s == ChannelState::Reconnecting)
            .await
            .unwrap();

        assert!(matches!(
            h.controller.submit_text("are you there?").await,
            Err(CoachError::NotConnected { .. })
        ));
        assert_eq!(h.controller.transcript().len(), 1);
        assert_eq!(h.controller.state(), ControllerState::AwaitingUserTurn);
    }

    #[tokio::test]
    async fn reply_audio_is_enqueued_after_append() {
        let h = harness();
        ready(&h).await;
        let mut playback = h.controller.inner.audio.playback_events();

        h.controller.submit_text("hello").await.unwrap();
        let audio = wav::encode_wav(&[1, 2, 3, 4], 16000).unwrap();
        h.socket.push_json(json!({
            "type": "patient_response",
            "message": "Hi there.",
            "audio_base64": BASE64.encode(&audio),
        }));

        // Id 1 is the opening line.
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), playback.recv())
                .await
                .unwrap()
                .unwrap();
            if event == (PlaybackEvent::Finished { id: 2 }) {
                break;
            }
        }
        assert_eq!(h.controller.transcript().len(), 3);
    }

    #[tokio::test]
    async fn bad_reply_audio_keeps_text_turn() {
        let mut h = harness();
        ready(&h).await;
        h.controller.submit_text("hello").await.unwrap();

        h.socket.push_json(json!({
            "type": "patient_response",
            "message": "Text still counts.",
            "audio_base64": "%%% not base64 %%%",
        }));
        wait_for_state(&mut h, ControllerState::AwaitingUserTurn).await;
        assert_eq!(h.controller.transcript()[2].text, "Text still counts.");
    }

    #[tokio::test]
    async fn reply_audio_url_is_fetched() {
        let audio = wav::encode_wav(&[9; 8], 16000).unwrap();
        let mut h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new().with_audio(
                "https://cdn.test/r.wav",
                AudioPayload::new(AudioFormat::Wav, audio),
            ),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;
        h.controller.submit_text("hello").await.unwrap();

        h.socket.push_json(json!({
            "type": "patient_response",
            "message": "Listen.",
            "audio_url": "https://cdn.test/r.wav",
        }));
        wait_for_state(&mut h, ControllerState::AwaitingUserTurn).await;

        let entry = &h.controller.transcript()[2];
        assert_eq!(entry.audio_ref.as_deref(), Some("https://cdn.test/r.wav"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.api.calls().contains(&SessionOp::FetchAudio) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn server_error_event_returns_turn_to_user() {
        let mut h = harness();
        ready(&h).await;
        h.controller.submit_text("hello").await.unwrap();

        h.socket.push_json(json!({"type": "error", "message": "LLM unavailable"}));

        let message = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ControllerEvent::ServerError { message }) = h.events.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message, "LLM unavailable");
        assert_eq!(h.controller.state(), ControllerState::AwaitingUserTurn);
    }

    #[tokio::test]
    async fn unknown_and_malformed_events_are_ignored() {
        let mut h = harness();
        ready(&h).await;
        h.controller.submit_text("hello").await.unwrap();

        h.socket.push_json(json!({"type": "typing_indicator"}));
        h.socket.push_text("garbage");
        h.socket.push_json(json!({"type": "patient_response", "message": "still here"}));
        wait_for_state(&mut h, ControllerState::AwaitingUserTurn).await;

        assert_eq!(h.controller.transcript().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhaustion_errors_controller() {
        let mut h = harness_with(
            MockSocketTransport::new().with_script([
                MockConnect::Accept,
                MockConnect::Refuse,
                MockConnect::Refuse,
            ]),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;

        h.socket.drop_connection();
        wait_for_state(&mut h, ControllerState::Errored).await;
        assert_eq!(h.controller.channel_state(), ChannelState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_errors_when_configured() {
        let mut h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig {
                reply_timeout: Some(Duration::from_secs(30)),
                ..ControllerConfig::default()
            },
        );
        ready(&h).await;
        h.controller.submit_text("hello?").await.unwrap();

        wait_for_state(&mut h, ControllerState::Errored).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reply_before_timeout_cancels_it() {
        let mut h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig {
                reply_timeout: Some(Duration::from_secs(30)),
                ..ControllerConfig::default()
            },
        );
        ready(&h).await;
        h.controller.submit_text("hello?").await.unwrap();
        h.socket.push_json(json!({"type": "patient_response", "message": "Yes?"}));
        wait_for_state(&mut h, ControllerState::AwaitingUserTurn).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.controller.state(), ControllerState::AwaitingUserTurn);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_turn() {
        let h = harness_with(
            MockSocketTransport::new(),
            MockSessionApi::new().failing(SessionOp::PostMessage),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        ready(&h).await;

        h.controller.submit_text("hello").await.unwrap();
        assert_eq!(h.socket.sent().len(), 1);
        assert_eq!(h.controller.state(), ControllerState::AwaitingPatientTurn);
    }

    #[tokio::test]
    async fn end_scenario_completes_and_tears_down() {
        let h = harness();
        ready(&h).await;
        h.controller.start_capture().await.unwrap();

        let summary = h.controller.end_scenario(Some("Acute MI")).await.unwrap();

        assert_eq!(summary.duration, Some(42));
        assert_eq!(h.controller.state(), ControllerState::Completed);
        assert_eq!(h.controller.channel_state(), ChannelState::Closed);
        assert!(!h.mic.is_active());
        assert_eq!(
            h.api.completions(),
            vec![("session-test".to_string(), Some("Acute MI".to_string()))]
        );
        assert!(matches!(
            h.controller.end_scenario(None).await,
            Err(CoachError::InvalidState { .. })
        ));

        let report = h.controller.fetch_report().await.unwrap();
        assert_eq!(report.overall_score, Some(80.0));
    }

    #[tokio::test]
    async fn fetch_report_requires_completion() {
        let h = harness();
        ready(&h).await;
        assert!(matches!(
            h.controller.fetch_report().await,
            Err(CoachError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn end_scenario_after_error_only_tears_down() {
        let h = harness_with(
            MockSocketTransport::new().with_script([MockConnect::Refuse]),
            MockSessionApi::new(),
            MockTranscriber::new(),
            MockMicrophone::new(),
            ControllerConfig::default(),
        );
        let _ = h.controller.initialize("s", "u").await;

        assert!(matches!(
            h.controller.end_scenario(None).await,
            Err(CoachError::InvalidState { .. })
        ));
        assert_eq!(h.controller.state(), ControllerState::Errored);
        assert!(h.api.completions().is_empty());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_silences_events() {
        let mut h = harness();
        ready(&h).await;
        while h.events.try_recv().is_ok() {}

        h.controller.dispose();
        h.controller.dispose();
        h.socket.push_json(json!({"type": "patient_response", "message": "ghost"}));
        tokio::task::yield_now().await;

        assert!(h.controller.is_disposed());
        assert_eq!(h.controller.transcript().len(), 1);
        assert!(h.events.try_recv().is_err());
        assert!(matches!(
            h.controller.submit_text("x").await,
            Err(CoachError::InvalidState { .. })
        ));
    }
}
