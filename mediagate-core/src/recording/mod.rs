//! Recording engine: continuous and event-triggered persistence of streams
//! to MPEG-TS segments, plus retention and the playback query surface.
//!
//! Every active stream gets one recorder task (see [`recorder`]), started
//! when the stream goes live. The recorder always keeps the pre-roll ring;
//! continuous recording and event captures are commands sent to it.

pub mod lease;
pub mod policy;
pub mod preroll;
pub mod recorder;
pub mod retention;
pub mod segment;
pub mod writer;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::{
    fs,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

pub use lease::{DeleteGuard, LeaseTable, SegmentLease};
pub use policy::PolicyStore;
pub use recorder::{EventCapture, RecorderStatus, RecordingState};
pub use retention::{ReconcileReport, SweepReport};
pub use segment::{SegmentIndex, SegmentRecord, SegmentStatus, StreamRecordings, TriggerReason};
pub use writer::{DiskFiles, SegmentFile, SegmentFiles};

use self::recorder::{Recorder, RecorderCommand, RecorderContext};
use crate::{
    config::RecordingConfig,
    error::{GatewayError, Result},
    frame::{Protocol, StreamKey},
    output::{AttachOptions, FrameConsumer},
    registry::StreamHandle,
};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Pre/post-roll overrides for one trigger; unset values come from the
/// stream's policy.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventRequest {
    pub pre_roll_seconds: Option<u32>,
    pub post_roll_seconds: Option<u32>,
}

struct RecorderHandle {
    stream: StreamHandle,
    commands: mpsc::Sender<RecorderCommand>,
    status: Arc<RwLock<RecorderStatus>>,
}

/// A segment opened for download. The lease keeps retention away until
/// the download is dropped.
pub struct SegmentDownload {
    pub record: SegmentRecord,
    pub file: fs::File,
    pub lease: SegmentLease,
}

pub struct RecordingEngine {
    ctx: Arc<RecorderContext>,
    queue_capacity: usize,
    sweep_interval: Duration,
    policies: Arc<PolicyStore>,
    leases: Arc<LeaseTable>,
    recorders: DashMap<StreamKey, RecorderHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecordingEngine {
    #[must_use]
    pub fn new(config: &RecordingConfig, queue_capacity: usize, policies: Arc<PolicyStore>) -> Arc<Self> {
        Self::with_files(config, queue_capacity, policies, Arc::new(DiskFiles))
    }

    /// Like [`Self::new`], with segment files created through `files`.
    #[must_use]
    pub fn with_files(
        config: &RecordingConfig,
        queue_capacity: usize,
        policies: Arc<PolicyStore>,
        files: Arc<dyn SegmentFiles>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(RecorderContext {
                root: PathBuf::from(&config.root),
                retry_attempts: config.storage_retry_attempts,
                index: Arc::new(SegmentIndex::new()),
                files,
            }),
            queue_capacity,
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
            policies,
            leases: LeaseTable::new(),
            recorders: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.ctx.root
    }

    #[must_use]
    pub const fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    #[must_use]
    pub fn index(&self) -> &SegmentIndex {
        &self.ctx.index
    }

    #[must_use]
    pub const fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Startup pass over the recording root; see [`retention::reconcile`].
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        fs::create_dir_all(&self.ctx.root)
            .await
            .map_err(|e| GatewayError::storage(format!("create {}: {e}", self.ctx.root.display())))?;
        retention::reconcile(&self.ctx.root, &self.ctx.index).await
    }

    /// Starts the stream's recorder unless one is already running for this
    /// stream instance.
    pub fn attach(&self, stream: &StreamHandle) -> Result<()> {
        if let Some(existing) = self.recorders.get(stream.key()) {
            if Arc::ptr_eq(&existing.stream, stream) && !existing.commands.is_closed() {
                return Ok(());
            }
        }

        let options = AttachOptions {
            start_at_keyframe: true,
            replay_gop: true,
            resync_on_overrun: true,
            queue_capacity: self.queue_capacity,
            offer_sdp: None,
        };
        let consumer = FrameConsumer::attach(stream, Protocol::Record, &options)?;
        let status = Arc::new(RwLock::new(RecorderStatus::default()));
        let (commands, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let recorder = Recorder::new(Arc::clone(&self.ctx), Arc::clone(stream), consumer, Arc::clone(&status));

        let span = tracing::info_span!("recorder", stream = %stream.key());
        let task = tokio::spawn(recorder.run(rx).instrument(span));
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        drop(tasks);

        self.recorders.insert(
            stream.key().clone(),
            RecorderHandle {
                stream: Arc::clone(stream),
                commands,
                status,
            },
        );
        Ok(())
    }

    fn commands(&self, key: &StreamKey) -> Result<mpsc::Sender<RecorderCommand>> {
        self.recorders
            .get(key)
            .filter(|r| !r.commands.is_closed())
            .map(|r| r.commands.clone())
            .ok_or_else(|| GatewayError::NotFound(format!("stream {key} is not live")))
    }

    async fn request<T>(
        &self,
        key: &StreamKey,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> RecorderCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands(key)?
            .send(command(tx))
            .await
            .map_err(|_| GatewayError::NotFound(format!("stream {key} is not live")))?;
        rx.await
            .map_err(|_| GatewayError::NotFound(format!("stream {key} ended")))?
    }

    /// `Busy` when the stream is already recording.
    pub async fn start_continuous(&self, key: &StreamKey) -> Result<()> {
        self.request(key, RecorderCommand::StartContinuous).await
    }

    /// Closes the open segment and returns it; `None` when recording was
    /// stopped before the first keyframe opened a segment.
    pub async fn stop_continuous(&self, key: &StreamKey) -> Result<Option<SegmentRecord>> {
        self.request(key, RecorderCommand::StopContinuous).await
    }

    pub async fn trigger_event(&self, key: &StreamKey, request: EventRequest) -> Result<EventCapture> {
        let policy = self.policies.get(key);
        let pre_roll_seconds = request.pre_roll_seconds.unwrap_or(policy.pre_roll_seconds);
        let post_roll_seconds = request.post_roll_seconds.unwrap_or(policy.post_roll_seconds);
        self.request(key, |reply| RecorderCommand::TriggerEvent {
            pre_roll_seconds,
            post_roll_seconds,
            reply,
        })
        .await
    }

    #[must_use]
    pub fn status(&self, key: &StreamKey) -> Option<RecorderStatus> {
        self.recorders.get(key).map(|r| r.status.read().clone())
    }

    #[must_use]
    pub fn is_recording(&self, key: &StreamKey) -> bool {
        self.status(key).is_some_and(|s| s.state == RecordingState::Recording || s.event_capturing)
    }

    #[must_use]
    pub fn list_segments(
        &self,
        key: &StreamKey,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<SegmentRecord> {
        self.ctx.index.list(key, start, end)
    }

    #[must_use]
    pub fn segments_on(&self, key: &StreamKey, date: NaiveDate) -> Vec<SegmentRecord> {
        self.ctx.index.on_date(key, date)
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<StreamRecordings> {
        self.ctx.index.summaries()
    }

    /// Opens a closed segment for reading under a lease.
    pub async fn open_segment(&self, id: &str) -> Result<SegmentDownload> {
        let record = self
            .ctx
            .index
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("segment {id}")))?;
        match record.status {
            SegmentStatus::Open => return Err(GatewayError::Busy(format!("segment {id} is still being written"))),
            SegmentStatus::Missing => return Err(GatewayError::NotFound(format!("segment {id} file is missing"))),
            SegmentStatus::Complete | SegmentStatus::Incomplete => {}
        }
        // lease first, so a sweep between the two steps cannot win
        let lease = self
            .leases
            .acquire(id)
            .ok_or_else(|| GatewayError::NotFound(format!("segment {id} is being deleted")))?;
        let file = fs::File::open(&record.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GatewayError::NotFound(format!("segment {id} file is missing"))
            } else {
                GatewayError::storage(format!("open {}: {e}", record.path.display()))
            }
        })?;
        Ok(SegmentDownload { record, file, lease })
    }

    /// Deletes every recording of a stream. Refused while the stream is
    /// recording or any of its segments is leased.
    pub async fn delete_all(&self, key: &StreamKey) -> Result<usize> {
        if self.is_recording(key) {
            return Err(GatewayError::Busy(format!("{key} is recording")));
        }
        let segments = self.ctx.index.list(key, None, None);
        let mut reserved = Vec::with_capacity(segments.len());
        for segment in &segments {
            let guard = self
                .leases
                .try_reserve_delete(&segment.id)
                .ok_or_else(|| GatewayError::Busy(format!("segment {} is being read", segment.id)))?;
            reserved.push(guard);
        }
        for segment in &segments {
            retention::delete_segment(segment).await?;
            self.ctx.index.remove(&segment.id);
        }
        let dir = segment::stream_dir(&self.ctx.root, key);
        match fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(stream = %key, error = %e, "Could not remove recording directory");
            }
            _ => {}
        }
        info!(stream = %key, deleted = segments.len(), "Recordings deleted");
        Ok(segments.len())
    }

    pub async fn sweep(&self) -> SweepReport {
        retention::sweep(&self.ctx.root, &self.ctx.index, &self.policies, &self.leases).await
    }

    /// Periodic retention until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.sweep().await;
                        engine.recorders.retain(|_, r| !r.commands.is_closed());
                    }
                }
            }
        })
    }

    /// Waits for every recorder to close its segments. Streams must have
    /// been closed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let all = futures::future::join_all(tasks);
        let done = tokio::time::timeout(timeout, all).await.is_ok();
        if !done {
            warn!("Recorders did not finish before the shutdown timeout");
        }
        self.recorders.clear();
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetentionPolicy,
        output::tests::{stream, video},
    };

    fn engine(root: &Path) -> Arc<RecordingEngine> {
        let config = RecordingConfig {
            root: root.to_string_lossy().into_owned(),
            storage_retry_attempts: 1,
            ..RecordingConfig::default()
        };
        RecordingEngine::new(&config, 4096, Arc::new(PolicyStore::new(RetentionPolicy::default())))
    }

    async fn wait_for_segments(engine: &RecordingEngine, key: &StreamKey, count: usize) -> Vec<SegmentRecord> {
        for _ in 0..200 {
            let segments = engine.list_segments(key, None, None);
            if segments.len() >= count {
                return segments;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} segments");
    }

    #[tokio::test]
    async fn test_start_twice_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let stream = stream("cam1");
        engine.attach(&stream).unwrap();
        engine.attach(&stream).unwrap();

        engine.start_continuous(stream.key()).await.unwrap();
        let err = engine.start_continuous(stream.key()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Busy(_)));
        assert!(engine.is_recording(stream.key()));
    }

    #[tokio::test]
    async fn test_stop_closes_segment_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let stream = stream("cam1");
        engine.attach(&stream).unwrap();
        engine.start_continuous(stream.key()).await.unwrap();
        for ts in (0..2000).step_by(40) {
            stream.bus().publish(video(ts, ts % 1000 == 0));
        }
        let record = engine.stop_continuous(stream.key()).await.unwrap().unwrap();
        assert_eq!(record.status, SegmentStatus::Complete);
        assert_eq!(record.trigger_reason, TriggerReason::Continuous);
        assert_eq!((record.end_time - record.start_time).num_milliseconds(), 1960);
        assert_eq!(stream.open_recordings(), 0);
        assert_eq!(engine.status(stream.key()).unwrap().state, RecordingState::Idle);

        let download = engine.open_segment(&record.id).await.unwrap();
        assert!(engine.leases().is_leased(&record.id));
        assert!(matches!(engine.delete_all(stream.key()).await, Err(GatewayError::Busy(_))));
        drop(download);
        assert_eq!(engine.delete_all(stream.key()).await.unwrap(), 1);
        assert!(!segment::stream_dir(dir.path(), stream.key()).exists());
    }

    #[tokio::test]
    async fn test_stop_before_first_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let stream = stream("cam1");
        engine.attach(&stream).unwrap();
        engine.start_continuous(stream.key()).await.unwrap();
        stream.bus().publish(video(0, false));

        assert!(engine.stop_continuous(stream.key()).await.unwrap().is_none());
        let status = engine.status(stream.key()).unwrap();
        assert_eq!(status.state, RecordingState::Idle);
        assert!(status.current_segment.is_none());
        assert!(engine.list_segments(stream.key(), None, None).is_empty());

        // stopped means stopped: a second stop is refused
        assert!(matches!(
            engine.stop_continuous(stream.key()).await,
            Err(GatewayError::NotFound(_))
        ));
        engine.start_continuous(stream.key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_does_not_wait_for_later_frames() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let stream = stream("cam1");
        engine.attach(&stream).unwrap();
        engine.start_continuous(stream.key()).await.unwrap();
        for ts in (0..5000).step_by(1000) {
            stream.bus().publish(video(ts, true));
        }

        // queue the stop, then keep publishing before the recorder runs
        let mut stop = std::pin::pin!(engine.stop_continuous(stream.key()));
        assert!(futures::poll!(stop.as_mut()).is_pending());
        for ts in (5000..10_000).step_by(1000) {
            stream.bus().publish(video(ts, true));
        }

        let record = stop.await.unwrap().unwrap();
        assert_eq!((record.end_time - record.start_time).num_milliseconds(), 4000);
        assert_eq!(engine.list_segments(stream.key(), None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_commands_for_unknown_stream() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let key = StreamKey::new("live", "nobody").unwrap();
        assert!(matches!(engine.start_continuous(&key).await, Err(GatewayError::NotFound(_))));
        assert!(matches!(engine.open_segment("nope").await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stream_end_closes_open_segments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let stream = stream("cam1");
        engine.attach(&stream).unwrap();
        engine.start_continuous(stream.key()).await.unwrap();
        for ts in (0..1000).step_by(40) {
            stream.bus().publish(video(ts, ts == 0));
        }
        stream.close();
        assert!(engine.shutdown(Duration::from_secs(5)).await);
        let segments = wait_for_segments(&engine, stream.key(), 1).await;
        assert_eq!(segments[0].status, SegmentStatus::Complete);
        assert_eq!(stream.open_recordings(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_marks_recording_failed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("live"), b"not a directory").unwrap();
        let engine = engine(dir.path());
        let stream = stream("cam1");
        let mut events = stream.subscribe_events();
        engine.attach(&stream).unwrap();
        engine.start_continuous(stream.key()).await.unwrap();
        stream.bus().publish(video(0, true));

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(crate::registry::StreamEvent::RecordingFailed(reason)) = events.recv().await {
                    break reason;
                }
            }
        })
        .await
        .unwrap();
        assert!(event.contains("cannot open segment"));
        let status = engine.status(stream.key()).unwrap();
        assert_eq!(status.state, RecordingState::Failed);
        assert!(status.last_error.is_some());
    }
}
