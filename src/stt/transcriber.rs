use crate::audio::format::AudioPayload;
use crate::error::{CoachError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};

/// Trait for speech-to-text transcription.
///
/// This trait allows swapping implementations (remote gateway vs mock).
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one finished recording to text.
    ///
    /// # Errors
    /// `Transcription` carrying the remote status when available.
    async fn transcribe(&self, payload: &AudioPayload) -> Result<String>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Implement Transcriber for Arc<T> to allow sharing across sessions.
#[async_trait]
impl<T: Transcriber + ?Sized> Transcriber for Arc<T> {
    async fn transcribe(&self, payload: &AudioPayload) -> Result<String> {
        (**self).transcribe(payload).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Mock transcriber for testing
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    response: String,
    failure_status: Option<Option<u16>>,
    gate: Option<Arc<Semaphore>>,
    calls: Arc<AtomicUsize>,
    started: Arc<Notify>,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings
    pub fn new() -> Self {
        Self {
            response: "mock transcription".to_string(),
            failure_status: None,
            gate: None,
            calls: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Notify::new()),
        }
    }

    /// Configure the mock to return a specific response
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to fail on transcribe
    pub fn with_failure(mut self, status: Option<u16>) -> Self {
        self.failure_status = Some(status);
        self
    }

    /// Hold every transcription until [`release`](Self::release) is called.
    pub fn held(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let one held transcription finish.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Number of transcribe calls so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least one transcription has started.
    pub async fn wait_started(&self) {
        loop {
            let notified = self.started.notified();
            if self.call_count() > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _payload: &AudioPayload) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_waiters();

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|e| CoachError::Transcription {
                status: None,
                message: format!("mock gate closed: {}", e),
            })?;
            permit.forget();
        }

        match self.failure_status {
            Some(status) => Err(CoachError::Transcription {
                status,
                message: "mock transcription failure".to_string(),
            }),
            None => Ok(self.response.clone()),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
