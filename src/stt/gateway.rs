//! Remote transcription over the speech REST endpoint.

use crate::api::transport::{ApiRequest, RequestTransport};
use crate::audio::format::{AudioFormat, AudioPayload};
use crate::defaults;
use crate::error::{CoachError, Result};
use crate::stt::transcriber::Transcriber;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

const TRANSCRIBE_PATH: &str = "/voice/transcribe";

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
}

/// Sends one recording to `/voice/transcribe` and returns the text.
///
/// Never retries; a failed transcription is reported to the caller.
pub struct TranscriptionGateway {
    transport: Arc<dyn RequestTransport>,
}

impl TranscriptionGateway {
    pub fn new(transport: Arc<dyn RequestTransport>) -> Self {
        Self { transport }
    }

    /// Upload name for a payload, e.g. `recording.webm`.
    pub fn file_name(format: AudioFormat) -> String {
        format!("{}.{}", defaults::RECORDING_FILE_STEM, format.extension())
    }
}

#[async_trait]
impl Transcriber for TranscriptionGateway {
    async fn transcribe(&self, payload: &AudioPayload) -> Result<String> {
        if payload.is_empty() {
            return Err(CoachError::Transcription {
                status: None,
                message: "Recording is empty".to_string(),
            });
        }

        let request = ApiRequest::post(TRANSCRIBE_PATH).with_file(
            "file",
            Self::file_name(payload.format),
            payload.format.mime_type(),
            payload.data.clone(),
        );
        tracing::debug!(?payload, "uploading recording for transcription");

        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| CoachError::Transcription {
                status: e.status(),
                message: e.to_string(),
            })?;

        if !response.is_success() {
            return Err(CoachError::Transcription {
                status: Some(response.status),
                message: response.error_message(),
            });
        }

        let body: TranscribeResponse =
            serde_json::from_slice(&response.body).map_err(|e| CoachError::Transcription {
                status: Some(response.status),
                message: format!("Unexpected transcription response: {}", e),
            })?;
        Ok(body.text.trim().to_string())
    }

    fn name(&self) -> &str {
        "remote"
    }
}
