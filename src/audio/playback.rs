//! Sequential playback queue.
//!
//! Payloads are played one at a time by a single worker task. The worker
//! owns the speaker for the lifetime of the queue; callers only enqueue,
//! skip, or dispose.

use crate::audio::format::AudioPayload;
use crate::audio::wav;
use crate::defaults;
use crate::error::{CoachError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Output device abstraction.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Play one payload to completion.
    ///
    /// Implementations must return promptly once `stop` becomes true, and
    /// must not return before their audio has actually stopped.
    async fn play(&self, payload: &AudioPayload, stop: Arc<AtomicBool>) -> Result<()>;
}

/// Observable lifecycle of queued items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { id: u64 },
    Finished { id: u64 },
    Skipped { id: u64 },
    Failed { id: u64, message: String },
}

struct QueuedPayload {
    id: u64,
    payload: AudioPayload,
}

struct Shared {
    /// Id of the item currently playing
    current: watch::Sender<Option<u64>>,
    /// Id the caller asked to skip
    skip_request: watch::Sender<u64>,
    /// Stop flag of the in-flight play call
    current_stop: Mutex<Option<Arc<AtomicBool>>>,
    pending: AtomicUsize,
    events: broadcast::Sender<PlaybackEvent>,
}

/// Ordered playback queue; at most one payload is ever playing.
pub struct PlaybackQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedPayload>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl PlaybackQueue {
    /// Spawn the playback worker. Must be called inside a tokio runtime.
    pub fn new(speaker: Arc<dyn Speaker>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(defaults::PLAYBACK_EVENT_BUFFER);
        let shared = Arc::new(Shared {
            current: watch::Sender::new(None),
            skip_request: watch::Sender::new(0),
            current_stop: Mutex::new(None),
            pending: AtomicUsize::new(0),
            events,
        });

        let worker = tokio::spawn(run_worker(rx, speaker, Arc::clone(&shared)));

        Self {
            tx: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a payload. Returns its id, or `None` once the queue is disposed.
    pub fn enqueue(&self, payload: AudioPayload) -> Option<u64> {
        let guard = self.tx.lock().ok()?;
        let tx = guard.as_ref()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(QueuedPayload { id, payload }).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(id)
    }

    /// Stop the in-flight payload; the worker moves on to the next one.
    ///
    /// Returns the skipped id, or `None` when nothing was playing.
    pub fn skip_current(&self) -> Option<u64> {
        let current = *self.shared.current.borrow();
        if let Some(id) = current {
            self.shared.skip_request.send_replace(id);
        }
        current
    }

    /// Id of the payload currently playing.
    pub fn current(&self) -> Option<u64> {
        *self.shared.current.borrow()
    }

    /// Items waiting behind the current one (plus the current one, if any).
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }

    /// Stop playback, drop queued items and end the worker. Idempotent.
    pub fn dispose(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Ok(stop) = self.shared.current_stop.lock()
            && let Some(flag) = stop.as_ref()
        {
            flag.store(true, Ordering::SeqCst);
        }
        if let Ok(mut worker) = self.worker.lock()
            && let Some(handle) = worker.take()
        {
            handle.abort();
        }
        self.shared.current.send_replace(None);
        self.shared.pending.store(0, Ordering::SeqCst);
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedPayload>,
    speaker: Arc<dyn Speaker>,
    shared: Arc<Shared>,
) {
    let mut skip_rx = shared.skip_request.subscribe();

    while let Some(item) = rx.recv().await {
        let stop = Arc::new(AtomicBool::new(false));
        if let Ok(mut current_stop) = shared.current_stop.lock() {
            *current_stop = Some(Arc::clone(&stop));
        }
        shared.current.send_replace(Some(item.id));
        let _ = shared.events.send(PlaybackEvent::Started { id: item.id });
        tracing::debug!(id = item.id, payload = ?item.payload, "playback started");

        let play = speaker.play(&item.payload, Arc::clone(&stop));
        tokio::pin!(play);

        let event = tokio::select! {
            result = &mut play => match result {
                Ok(()) => PlaybackEvent::Finished { id: item.id },
                Err(e) => {
                    tracing::warn!(id = item.id, "discarding unplayable audio: {}", e);
                    PlaybackEvent::Failed { id: item.id, message: e.to_string() }
                }
            },
            _ = wait_for_skip(&mut skip_rx, item.id) => {
                stop.store(true, Ordering::SeqCst);
                // Let the speaker wind down so the next item never overlaps this one.
                if let Err(e) = play.await {
                    tracing::debug!(id = item.id, "skipped playback ended with: {}", e);
                }
                PlaybackEvent::Skipped { id: item.id }
            }
        };

        shared.current.send_replace(None);
        if let Ok(mut current_stop) = shared.current_stop.lock() {
            current_stop.take();
        }
        let _ = shared
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let _ = shared.events.send(event);
    }
}

async fn wait_for_skip(rx: &mut watch::Receiver<u64>, id: u64) {
    loop {
        if *rx.borrow_and_update() == id {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Mock speaker for testing
///
/// Decodes each payload as WAV (so corrupt payloads fail like on a real
/// device), then "plays" for a fixed duration. Tracks how many payloads are
/// playing at once.
#[derive(Debug, Clone)]
pub struct MockSpeaker {
    play_time: Duration,
    log: Arc<Mutex<Vec<SpeakerLogEntry>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

/// What the mock speaker observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeakerLogEntry {
    Began(usize),
    Ended(usize),
    Stopped(usize),
}

impl MockSpeaker {
    pub fn new(play_time: Duration) -> Self {
        Self {
            play_time,
            log: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Entries keyed by payload length, which tests use as a label.
    pub fn log(&self) -> Vec<SpeakerLogEntry> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Highest number of payloads ever playing simultaneously.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn record(&self, entry: SpeakerLogEntry) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }
}

#[async_trait]
impl Speaker for MockSpeaker {
    async fn play(&self, payload: &AudioPayload, stop: Arc<AtomicBool>) -> Result<()> {
        let decoded = wav::decode_wav(&payload.data)?;
        let label = decoded.samples.len();

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.record(SpeakerLogEntry::Began(label));

        let step = Duration::from_millis(5);
        let mut elapsed = Duration::ZERO;
        let mut stopped = false;
        while elapsed < self.play_time {
            if stop.load(Ordering::SeqCst) {
                stopped = true;
                break;
            }
            tokio::time::sleep(step).await;
            elapsed += step;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        if stopped {
            self.record(SpeakerLogEntry::Stopped(label));
            Err(CoachError::AudioPlayback {
                message: "stopped".to_string(),
            })
        } else {
            self.record(SpeakerLogEntry::Ended(label));
            Ok(())
        }
    }
}
