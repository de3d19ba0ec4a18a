//! Reconnecting duplex channel bound to one session.
//!
//! One reader task owns the inbound half of the connection. It dispatches
//! parsed events to subscribers in arrival order and, when the connection
//! drops, drives the [`ReconnectPolicy`] until it reconnects or gives up.

use crate::channel::protocol::{InboundEvent, OutboundEvent};
use crate::channel::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::channel::transport::{Frame, FrameSink, FrameStream, SocketTransport};
use crate::config::ChannelSettings;
use crate::error::{CoachError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connection lifecycle. Only the channel moves it; `Closed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Terminal failure reported to close handlers once reconnecting gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosed {
    pub reason: String,
    pub attempts: u32,
}

type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&ChannelClosed) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    events: Vec<(u64, EventHandler)>,
    close: Vec<(u64, CloseHandler)>,
}

struct Inner {
    transport: Arc<dyn SocketTransport>,
    base_url: String,
    settings: ChannelSettings,
    state: watch::Sender<ChannelState>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    handlers: Mutex<Handlers>,
    next_handler_id: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Duplex message channel for one session.
pub struct SessionChannel {
    inner: Arc<Inner>,
}

/// Handle returned by [`SessionChannel::subscribe`] and [`SessionChannel::on_close`].
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Remove the handler. Events already being dispatched may still reach it.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade()
            && let Ok(mut handlers) = inner.handlers.lock()
        {
            handlers.events.retain(|(id, _)| *id != self.id);
            handlers.close.retain(|(id, _)| *id != self.id);
        }
    }
}

impl SessionChannel {
    /// Create an unopened channel. `base_url` is the realtime endpoint root,
    /// e.g. `ws://localhost:8000`.
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        base_url: impl Into<String>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                base_url: base_url.into(),
                settings,
                state: watch::Sender::new(ChannelState::Connecting),
                writer: tokio::sync::Mutex::new(None),
                handlers: Mutex::new(Handlers::default()),
                next_handler_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        }
    }

    /// Endpoint URL for a session.
    pub fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/ws/{}",
            self.inner.base_url.trim_end_matches('/'),
            session_id
        )
    }

    /// Connect and start the reader task. Resolves once the channel is open.
    ///
    /// # Errors
    /// `Connection` if the handshake fails or exceeds the handshake timeout,
    /// or if the channel was closed. `InvalidState` if already opened.
    pub async fn open(&self, session_id: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoachError::Connection {
                message: "channel is closed".to_string(),
            });
        }
        if self.inner.reader.lock().map(|r| r.is_some()).unwrap_or(true) {
            return Err(CoachError::invalid_state("channel already opened"));
        }

        let url = self.session_url(session_id);
        self.inner.set_state(ChannelState::Connecting);
        tracing::debug!(url = %url, "opening session channel");

        let (sink, stream) = match self.inner.connect(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(url = %url, "session channel failed to open: {}", e);
                self.inner.set_state(ChannelState::Closed);
                return Err(e);
            }
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoachError::Connection {
                message: "channel closed while opening".to_string(),
            });
        }

        *self.inner.writer.lock().await = Some(sink);
        self.inner.set_state(ChannelState::Open);

        let task = tokio::spawn(run_reader(Arc::clone(&self.inner), stream, url));
        if let Ok(mut reader) = self.inner.reader.lock() {
            *reader = Some(task);
        }
        Ok(())
    }

    /// Serialize and transmit one event.
    ///
    /// # Errors
    /// `NotConnected` unless the channel is open. Nothing is buffered for
    /// later delivery.
    pub async fn send(&self, event: &OutboundEvent) -> Result<()> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(CoachError::NotConnected {
                state: state.to_string(),
            });
        }

        let text = event.to_json().map_err(|e| CoachError::Protocol {
            message: format!("Failed to encode outbound event: {}", e),
        })?;

        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or_else(|| CoachError::NotConnected {
            state: self.state().to_string(),
        })?;
        sink.send_text(text).await.inspect_err(|e| {
            tracing::warn!("session channel send failed: {}", e);
        })
    }

    /// Register an inbound event handler. Handlers run on the reader task in
    /// arrival order and must not block.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.events.push((id, Arc::new(handler)));
        }
        self.subscription(id)
    }

    /// Register a handler for the terminal "gave up reconnecting" notification.
    pub fn on_close<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelClosed) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.close.push((id, Arc::new(handler)));
        }
        self.subscription(id)
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Close the connection and drop every subscriber. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing session channel");

        if let Ok(mut reader) = self.inner.reader.lock()
            && let Some(task) = reader.take()
        {
            task.abort();
        }
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            *handlers = Handlers::default();
        }
        self.inner.state.send_replace(ChannelState::Closed);

        // Say goodbye if no send is in flight; otherwise the sink is dropped with the channel.
        if let Ok(mut writer) = self.inner.writer.try_lock()
            && let Some(mut sink) = writer.take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move {
                if let Err(e) = sink.close().await {
                    tracing::debug!("close frame not sent: {}", e);
                }
            });
        }
    }

    fn subscription(&self, id: u64) -> Subscription {
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transition unless already `Closed`.
    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ChannelState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "session channel state");
        }
    }

    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let timeout = self.settings.handshake_timeout();
        match tokio::time::timeout(timeout, self.transport.connect(url)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(CoachError::Connection { message })) => Err(CoachError::Connection { message }),
            Ok(Err(other)) => Err(CoachError::Connection {
                message: other.to_string(),
            }),
            Err(_) => Err(CoachError::Connection {
                message: format!("handshake timed out after {}ms", timeout.as_millis()),
            }),
        }
    }

    fn dispatch(&self, event: &InboundEvent) {
        let handlers: Vec<EventHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers.events.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Reconnect budget exhausted: close for good and tell the close handlers.
    async fn give_up(&self, closed: ChannelClosed) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(
            attempts = closed.attempts,
            "session channel closed after failed reconnects: {}",
            closed.reason
        );

        self.writer.lock().await.take();
        self.state.send_replace(ChannelState::Closed);

        let handlers = match self.handlers.lock() {
            Ok(mut handlers) => std::mem::take(&mut *handlers).close,
            Err(_) => return,
        };
        for (_, handler) in handlers {
            handler(&closed);
        }
    }
}

/// Read frames until the connection drops. Returns the drop reason.
async fn read_until_drop(inner: &Inner, stream: &mut Box<dyn FrameStream>) -> String {
    loop {
        match stream.next_frame().await {
            Ok(Frame::Text(text)) => match InboundEvent::from_json(&text) {
                Ok(event) => inner.dispatch(&event),
                Err(e) => tracing::warn!(
                    len = text.len(),
                    "dropping malformed inbound frame: {}",
                    e
                ),
            },
            Ok(Frame::Closed) => return "closed by server".to_string(),
            Err(e) => return e.to_string(),
        }
    }
}

async fn run_reader(inner: Arc<Inner>, mut stream: Box<dyn FrameStream>, url: String) {
    let mut policy = ReconnectPolicy::new(
        inner.settings.reconnect_base_delay(),
        inner.settings.max_reconnect_attempts,
    );

    loop {
        let mut reason = read_until_drop(&inner, &mut stream).await;
        if inner.is_closed() {
            return;
        }
        tracing::warn!("session channel dropped: {}", reason);
        inner.writer.lock().await.take();

        stream = loop {
            match policy.next_attempt() {
                ReconnectDecision::GiveUp { attempts } => {
                    inner.give_up(ChannelClosed { reason, attempts }).await;
                    return;
                }
                ReconnectDecision::Retry { attempt, delay } => {
                    inner.set_state(ChannelState::Reconnecting);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                    tokio::time::sleep(delay).await;
                    if inner.is_closed() {
                        return;
                    }

                    match inner.connect(&url).await {
                        Ok((sink, stream)) => {
                            if inner.is_closed() {
                                return;
                            }
                            *inner.writer.lock().await = Some(sink);
                            inner.set_state(ChannelState::Open);
                            tracing::debug!(attempt, "session channel reconnected");
                            policy.reset();
                            break stream;
                        }
                        Err(e) => {
                            tracing::warn!(attempt, "reconnect attempt failed: {}", e);
                            reason = e.to_string();
                        }
                    }
                }
            }
        };
    }
}
