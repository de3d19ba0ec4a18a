//! Socket transport abstraction for the session channel.

use crate::error::{CoachError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

/// One inbound frame as seen by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Remote closed the connection cleanly
    Closed,
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text or close frame. An error means the connection dropped.
    async fn next_frame(&mut self) -> Result<Frame>;
}

/// Opens duplex connections.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// How a [`MockSocketTransport`] answers one connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockConnect {
    Accept,
    Refuse,
    /// Never completes; exercises handshake timeouts
    Hang,
}

type InboundSender = mpsc::UnboundedSender<Result<Frame>>;

#[derive(Default)]
struct MockState {
    script: VecDeque<MockConnect>,
    urls: Vec<String>,
    sent: Vec<String>,
    inbound: Option<InboundSender>,
}

/// Mock transport for testing
///
/// Connect outcomes are scripted; once the script is exhausted every connect
/// is accepted. Clones share state, so a test keeps one handle and gives the
/// other to the channel.
#[derive(Clone, Default)]
pub struct MockSocketTransport {
    state: Arc<Mutex<MockState>>,
    sent_notify: Arc<Notify>,
}

impl MockSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue connect outcomes, consumed in order.
    pub fn with_script(self, script: impl IntoIterator<Item = MockConnect>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.script.extend(script);
        }
        self
    }

    /// Append one more scripted connect outcome.
    pub fn push_connect(&self, outcome: MockConnect) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(outcome);
        }
    }

    /// Deliver a text frame on the current connection.
    ///
    /// Returns false when no connection is live.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Ok(Frame::Text(text.into())))
    }

    /// Serialize and deliver a JSON value on the current connection.
    pub fn push_json(&self, value: serde_json::Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Remote sends a clean close frame.
    pub fn close_from_server(&self) -> bool {
        self.push(Ok(Frame::Closed))
    }

    /// Drop the current connection as a network failure would.
    pub fn drop_connection(&self) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|mut state| state.inbound.take())
            .is_some()
    }

    /// Every text frame the client sent, across all connections.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Sent frames parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Wait until at least `count` frames have been sent.
    pub async fn wait_for_sent(&self, count: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.sent().len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.state.lock().map(|s| s.urls.len()).unwrap_or(0)
    }

    /// URLs passed to connect, in order.
    pub fn urls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.urls.clone()).unwrap_or_default()
    }

    fn push(&self, frame: Result<Frame>) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.inbound.as_ref().map(|tx| tx.send(frame).is_ok()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SocketTransport for MockSocketTransport {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let outcome = {
            let mut state = self.state.lock().map_err(|e| CoachError::Connection {
                message: format!("mock transport poisoned: {}", e),
            })?;
            state.urls.push(url.to_string());
            state.script.pop_front().unwrap_or(MockConnect::Accept)
        };

        match outcome {
            MockConnect::Refuse => Err(CoachError::Connection {
                message: format!("connection refused: {}", url),
            }),
            MockConnect::Hang => std::future::pending().await,
            MockConnect::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                if let Ok(mut state) = self.state.lock() {
                    state.inbound = Some(tx);
                }
                let sink = MockFrameSink {
                    state: Arc::clone(&self.state),
                    notify: Arc::clone(&self.sent_notify),
                };
                Ok((Box::new(sink), Box::new(MockFrameStream { rx })))
            }
        }
    }
}

struct MockFrameSink {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl FrameSink for MockFrameSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        {
            let mut state = self.state.lock().map_err(|e| CoachError::Connection {
                message: format!("mock transport poisoned: {}", e),
            })?;
            if state.inbound.is_none() {
                return Err(CoachError::Connection {
                    message: "mock connection is down".to_string(),
                });
            }
            state.sent.push(text);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.inbound.take();
        }
        Ok(())
    }
}

struct MockFrameStream {
    rx: mpsc::UnboundedReceiver<Result<Frame>>,
}

#[async_trait]
impl FrameStream for MockFrameStream {
    async fn next_frame(&mut self) -> Result<Frame> {
        match self.rx.recv().await {
            Some(frame) => frame,
            None => Err(CoachError::Connection {
                message: "mock connection dropped".to_string(),
            }),
        }
    }
}
