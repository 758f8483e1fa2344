//! Stream registry: the one process-wide map, keyed by `app/stream`.
//!
//! The map is a sharded `DashMap`, so lookups for unrelated keys never
//! contend. Each entry is an `Arc<Stream>` whose identity is stable for the
//! stream's lifetime; concurrent registrations of one key resolve to the same
//! handle.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    bus::FrameBus,
    config::RetentionPolicy,
    error::{GatewayError, Result},
    frame::{Protocol, StreamKey, TrackInfo},
    output::OutputFlags,
    recording::PolicyStore,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Active,
    Draining,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    State(StreamState),
    IngestFailed(String),
    RecordingFailed(String),
    Closed,
}

/// Where the media comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub protocol: Protocol,
    /// Pull url or push peer address.
    pub origin: String,
}

pub struct Stream {
    key: StreamKey,
    created_at: DateTime<Utc>,
    created: Instant,
    state: RwLock<StreamState>,
    source: RwLock<Option<SourceInfo>>,
    outputs: RwLock<OutputFlags>,
    bus: Arc<FrameBus>,
    policies: Arc<PolicyStore>,
    open_recordings: AtomicUsize,
    corrupt_frames: AtomicU64,
    idle_since: Mutex<Option<Instant>>,
    events: broadcast::Sender<StreamEvent>,
    cancel: CancellationToken,
}

pub type StreamHandle = Arc<Stream>;

impl Stream {
    fn new(key: StreamKey, gop_cache_size: usize, policies: Arc<PolicyStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            key,
            created_at: Utc::now(),
            created: Instant::now(),
            state: RwLock::new(StreamState::Idle),
            source: RwLock::new(None),
            outputs: RwLock::new(OutputFlags::default()),
            bus: FrameBus::new(gop_cache_size),
            policies,
            open_recordings: AtomicUsize::new(0),
            corrupt_frames: AtomicU64::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            events,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    #[must_use]
    pub const fn bus(&self) -> &Arc<FrameBus> {
        &self.bus
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub fn set_state(&self, state: StreamState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(stream = %self.key, ?previous, ?state, "Stream state changed");
            let _ = self.events.send(StreamEvent::State(state));
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<SourceInfo> {
        self.source.read().clone()
    }

    pub fn set_source(&self, source: Option<SourceInfo>) {
        *self.source.write() = source;
    }

    #[must_use]
    pub fn outputs(&self) -> OutputFlags {
        *self.outputs.read()
    }

    pub fn set_outputs(&self, flags: OutputFlags) {
        *self.outputs.write() = flags;
    }

    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.policies.get(&self.key)
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.bus.tracks()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Cancelled when the stream is torn down.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn recording_opened(&self) {
        self.open_recordings.fetch_add(1, Ordering::SeqCst);
    }

    pub fn recording_closed(&self) {
        let result = self
            .open_recordings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if result.is_err() {
            tracing::warn!(stream = %self.key, "Attempted to decrement recording count below zero");
        }
    }

    #[must_use]
    pub fn open_recordings(&self) -> usize {
        self.open_recordings.load(Ordering::SeqCst)
    }

    pub fn count_corrupt(&self) -> u64 {
        self.corrupt_frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.bus.viewer_count() > 0 || self.open_recordings() > 0
    }

    /// Tracks how long the stream has had no viewers; returns the idle
    /// duration so far, or `None` while it is in use.
    pub fn touch_idle(&self) -> Option<Duration> {
        let mut idle_since = self.idle_since.lock();
        if self.bus.viewer_count() > 0 {
            *idle_since = None;
            return None;
        }
        Some(idle_since.get_or_insert_with(Instant::now).elapsed())
    }

    /// Stops ingest and ends delivery; consumers and recorders see the end
    /// of the stream after draining their queues.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.set_state(StreamState::Draining);
        self.cancel.cancel();
        self.bus.close();
        self.emit(StreamEvent::Closed);
        info!(stream = %self.key, "Stream closed");
    }

    #[must_use]
    pub fn summary(&self) -> StreamSummary {
        let stats = self.bus.stats();
        let source = self.source();
        StreamSummary {
            app: self.key.app.clone(),
            stream: self.key.stream.clone(),
            state: self.state(),
            protocol: source.as_ref().map(|s| s.protocol),
            origin: source.map(|s| s.origin),
            created_at: self.created_at,
            alive_seconds: self.created.elapsed().as_secs(),
            last_frame_at: stats.last_frame_at,
            tracks: self.tracks(),
            consumers: self.bus.consumers(),
            open_recordings: self.open_recordings(),
            corrupt_frames: self.corrupt_frames(),
            frames: stats.frames,
            bytes: stats.bytes,
            overruns: stats.overruns,
            outputs: self.outputs(),
            policy: self.policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub app: String,
    pub stream: String,
    pub state: StreamState,
    pub protocol: Option<Protocol>,
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
    pub alive_seconds: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub tracks: Vec<TrackInfo>,
    pub consumers: HashMap<Protocol, usize>,
    pub open_recordings: usize,
    pub corrupt_frames: u64,
    pub frames: u64,
    pub bytes: u64,
    pub overruns: u64,
    pub outputs: OutputFlags,
    pub policy: RetentionPolicy,
}

pub struct Registry {
    streams: DashMap<StreamKey, StreamHandle>,
    accepting: AtomicBool,
    gop_cache_size: usize,
    policies: Arc<PolicyStore>,
}

impl Registry {
    /// Creates the registry; it accepts streams until [`Self::drain`].
    #[must_use]
    pub fn init(gop_cache_size: usize, policies: Arc<PolicyStore>) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            accepting: AtomicBool::new(true),
            gop_cache_size,
            policies,
        })
    }

    /// Returns the existing handle or creates one. Idempotent.
    pub fn register(&self, key: &StreamKey) -> Result<StreamHandle> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GatewayError::Busy("registry is draining".to_string()));
        }
        let handle = match self.streams.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let stream = Arc::new(Stream::new(
                    key.clone(),
                    self.gop_cache_size,
                    Arc::clone(&self.policies),
                ));
                info!(stream = %key, "Stream registered");
                Arc::clone(&entry.insert(stream))
            }
        };
        Ok(handle)
    }

    pub fn lookup(&self, key: &StreamKey) -> Result<StreamHandle> {
        self.streams
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::NotFound(format!("stream {key}")))
    }

    #[must_use]
    pub fn list_active(&self) -> Vec<StreamHandle> {
        let mut streams: Vec<StreamHandle> = self.streams.iter().map(|e| Arc::clone(e.value())).collect();
        streams.sort_by(|a, b| a.key().cmp(b.key()));
        streams
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Tears a stream down. Without `force` this is refused while consumers
    /// are attached or recordings are open.
    pub fn release(&self, key: &StreamKey, force: bool) -> Result<()> {
        let stream = self.lookup(key)?;
        if !force && stream.is_busy() {
            return Err(GatewayError::Busy(format!(
                "stream {key} has {} consumers and {} open recordings",
                stream.bus().viewer_count(),
                stream.open_recordings()
            )));
        }
        stream.close();
        self.streams.remove_if(key, |_, current| Arc::ptr_eq(current, &stream));
        Ok(())
    }

    /// Stops accepting streams, closes every stream and waits until their
    /// recordings have reached a safe boundary or `timeout` expires.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let streams = self.list_active();
        for stream in &streams {
            stream.close();
            self.streams.remove_if(stream.key(), |_, current| Arc::ptr_eq(current, stream));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = streams.iter().filter(|s| s.open_recordings() > 0).count();
            if pending == 0 {
                info!(streams = streams.len(), "Registry drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pending, "Registry drain timed out with open recordings");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}
