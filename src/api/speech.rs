//! Speech synthesis endpoint.

use crate::api::transport::{ApiRequest, RequestTransport};
use crate::api::types::VoiceParams;
use crate::audio::format::{AudioFormat, AudioPayload};
use crate::audio::wav;
use crate::defaults;
use crate::error::{CoachError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Text-to-speech for patient lines.
#[async_trait]
pub trait SpeechApi: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<AudioPayload>;
}

/// [`SpeechApi`] over any [`RequestTransport`].
pub struct RestSpeechApi {
    transport: Arc<dyn RequestTransport>,
}

impl RestSpeechApi {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SpeechApi for RestSpeechApi {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<AudioPayload> {
        let request = ApiRequest::post("/voice/synthesize").with_json(json!({
            "text": text,
            "voice_name": voice.voice_name,
            "emotional_style": voice.emotional_style,
        }));
        let response = self.transport.execute(request).await?.error_for_status()?;
        if response.body.is_empty() {
            return Err(CoachError::RemoteRequest {
                status: Some(response.status),
                message: "Speech synthesis returned no audio".to_string(),
            });
        }

        let format = response
            .content_type
            .as_deref()
            .map(AudioFormat::from_mime)
            .unwrap_or(AudioFormat::Wav);
        Ok(AudioPayload::new(format, response.body))
    }
}

/// Mock speech API for testing
///
/// Returns a short WAV tone per request whose sample count equals the text
/// length, so tests can tell payloads apart.
#[derive(Clone, Default)]
pub struct MockSpeechApi {
    requests: Arc<Mutex<Vec<(String, VoiceParams)>>>,
    should_fail: bool,
}

impl MockSpeechApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    /// Texts synthesized so far, with their voice parameters.
    pub fn requests(&self) -> Vec<(String, VoiceParams)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SpeechApi for MockSpeechApi {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<AudioPayload> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((text.to_string(), voice.clone()));
        }
        if self.should_fail {
            return Err(CoachError::RemoteRequest {
                status: Some(503),
                message: "mock speech service unavailable".to_string(),
            });
        }
        let samples = vec![0i16; text.chars().count().max(1)];
        let data = wav::encode_wav(&samples, defaults::SAMPLE_RATE)?;
        Ok(AudioPayload::new(AudioFormat::Wav, data))
    }
}
