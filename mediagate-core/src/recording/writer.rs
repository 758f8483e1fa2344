use std::{io, path::Path, time::Duration};

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::segment::{segment_path, SegmentRecord, SegmentStatus, TriggerReason};
use crate::{
    error::{GatewayError, Result},
    frame::{Frame, StreamKey, TrackInfo},
    output::ts::TsPackager,
    registry::StreamHandle,
};

/// Maps media timestamps onto wall-clock time, anchored at the first frame
/// a recorder saw.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    wall: DateTime<Utc>,
    dts_ms: i64,
}

impl MediaClock {
    #[must_use]
    pub const fn new(wall: DateTime<Utc>, dts_ms: i64) -> Self {
        Self { wall, dts_ms }
    }

    #[must_use]
    pub fn at(&self, dts_ms: i64) -> DateTime<Utc> {
        self.wall + TimeDelta::milliseconds(dts_ms - self.dts_ms)
    }
}

/// Destination of one segment's media bytes.
#[async_trait]
pub trait SegmentFile: Send + Sync {
    async fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flushes buffered data and syncs it to stable storage.
    async fn sync(&mut self) -> io::Result<()>;
}

#[async_trait]
impl SegmentFile for fs::File {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.sync_all().await
    }
}

/// Creates segment files below the recording root.
#[async_trait]
pub trait SegmentFiles: Send + Sync {
    async fn create(&self, path: &Path) -> io::Result<Box<dyn SegmentFile>>;
}

/// Plain files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFiles;

#[async_trait]
impl SegmentFiles for DiskFiles {
    async fn create(&self, path: &Path) -> io::Result<Box<dyn SegmentFile>> {
        Ok(Box::new(fs::File::create(path).await?))
    }
}

/// Counts as an open recording on the stream while alive.
struct OpenRecording(StreamHandle);

impl OpenRecording {
    fn new(stream: &StreamHandle) -> Self {
        stream.recording_opened();
        Self(stream.clone())
    }
}

impl Drop for OpenRecording {
    fn drop(&mut self) {
        self.0.recording_closed();
    }
}

/// One segment file being written. Stream teardown waits for it to be
/// closed or aborted.
pub struct SegmentWriter {
    file: Box<dyn SegmentFile>,
    packager: TsPackager,
    record: SegmentRecord,
    clock: MediaClock,
    first_dts: i64,
    last_dts: i64,
    stream: StreamHandle,
    _open: OpenRecording,
}

impl SegmentWriter {
    pub async fn open(
        files: &dyn SegmentFiles,
        root: &Path,
        stream: &StreamHandle,
        reason: TriggerReason,
        clock: MediaClock,
        first_dts: i64,
    ) -> Result<Self> {
        let key: &StreamKey = stream.key();
        let start = clock.at(first_dts);
        let id = nanoid::nanoid!();
        let path = segment_path(root, key, start, &id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| GatewayError::storage(format!("create {}: {e}", dir.display())))?;
        }
        let file = files
            .create(&path)
            .await
            .map_err(|e| GatewayError::storage(format!("create {}: {e}", path.display())))?;
        let record = SegmentRecord {
            id,
            stream_key: key.to_string(),
            start_time: start,
            end_time: start,
            size_bytes: 0,
            trigger_reason: reason,
            status: SegmentStatus::Open,
            path,
        };
        record.persist().await?;
        debug!(stream = %key, segment = %record.id, ?reason, "Segment opened");
        Ok(Self {
            file,
            packager: TsPackager::new(),
            record,
            clock,
            first_dts,
            last_dts: first_dts,
            stream: stream.clone(),
            _open: OpenRecording::new(stream),
        })
    }

    /// Opens with exponential backoff; the last error is returned once
    /// `attempts` retries are used up.
    pub async fn open_with_retry(
        files: &dyn SegmentFiles,
        root: &Path,
        stream: &StreamHandle,
        reason: TriggerReason,
        clock: MediaClock,
        first_dts: i64,
        attempts: usize,
    ) -> Result<Self> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(attempts)
            .with_jitter()
            .build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            match Self::open(files, root, stream, reason, clock, first_dts).await {
                Ok(writer) => return Ok(writer),
                Err(e) => {
                    warn!(stream = %stream.key(), error = %e, "Opening segment failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Storage("retry exhausted".to_string())))
    }

    pub async fn write(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<()> {
        self.packager.write(frame, tracks)?;
        let chunk = self.packager.take();
        if !chunk.is_empty() {
            self.file
                .append(&chunk)
                .await
                .map_err(|e| GatewayError::storage(format!("write {}: {e}", self.record.path.display())))?;
            self.record.size_bytes += chunk.len() as u64;
        }
        self.last_dts = self.last_dts.max(frame.dts_ms);
        Ok(())
    }

    #[must_use]
    pub const fn start_dts(&self) -> i64 {
        self.first_dts
    }

    #[must_use]
    pub const fn duration_ms(&self) -> i64 {
        self.last_dts - self.first_dts
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.record.size_bytes
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Flushes and closes the segment. `end_dts` is where the next segment
    /// starts, so consecutive segments meet without overlap.
    ///
    /// Always yields the final record: a failed flush or sidecar update
    /// leaves it `Incomplete` instead of `Complete`.
    pub async fn close(mut self, end_dts: Option<i64>) -> SegmentRecord {
        let end = end_dts.unwrap_or(self.last_dts).max(self.first_dts);
        self.record.end_time = self.clock.at(end);
        self.record.status = match self.file.sync().await {
            Ok(()) => SegmentStatus::Complete,
            Err(e) => {
                warn!(stream = %self.stream.key(), segment = %self.record.id, error = %e, "Segment flush failed");
                SegmentStatus::Incomplete
            }
        };
        if let Err(e) = self.record.persist().await {
            // the sidecar still says open; reconciliation repairs it the same way
            warn!(stream = %self.stream.key(), segment = %self.record.id, error = %e, "Could not update segment index");
            self.record.status = SegmentStatus::Incomplete;
        }
        debug!(
            stream = %self.stream.key(),
            segment = %self.record.id,
            size = self.record.size_bytes,
            status = ?self.record.status,
            "Segment closed"
        );
        self.record.clone()
    }

    /// Marks the segment `Incomplete` after a write failure. The sidecar
    /// update is best-effort; reconciliation repairs it otherwise.
    pub async fn abort(mut self) -> SegmentRecord {
        self.record.end_time = self.clock.at(self.last_dts);
        self.record.status = SegmentStatus::Incomplete;
        if let Err(e) = self.record.persist().await {
            warn!(segment = %self.record.id, error = %e, "Could not mark segment incomplete");
        }
        self.record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::{aac_track, audio, stream, video, video_track};

    #[tokio::test]
    async fn test_segment_lifecycle_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let stream = stream("cam1");
        let clock = MediaClock::new(Utc::now(), 0);
        let tracks = vec![video_track(), aac_track()];

        let mut writer = SegmentWriter::open(&DiskFiles, dir.path(), &stream, TriggerReason::Continuous, clock, 0)
            .await
            .unwrap();
        assert_eq!(stream.open_recordings(), 1);
        let sidecar = SegmentRecord::load(&writer.record.sidecar()).await.unwrap();
        assert_eq!(sidecar.status, SegmentStatus::Open);

        for frame in [video(0, true), audio(10), video(40, false)] {
            writer.write(&frame, &tracks).await.unwrap();
        }
        assert_eq!(writer.duration_ms(), 40);
        let record = writer.close(Some(80)).await;
        assert_eq!(stream.open_recordings(), 0);
        assert_eq!(record.status, SegmentStatus::Complete);
        assert_eq!((record.end_time - record.start_time).num_milliseconds(), 80);

        let on_disk = fs::metadata(&record.path).await.unwrap().len();
        assert_eq!(on_disk, record.size_bytes);
        assert_eq!(on_disk % 188, 0);
        assert_eq!(SegmentRecord::load(&record.sidecar()).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_close_with_unwritable_index_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let stream = stream("cam1");
        let clock = MediaClock::new(Utc::now(), 0);
        let mut writer = SegmentWriter::open(&DiskFiles, dir.path(), &stream, TriggerReason::Continuous, clock, 0)
            .await
            .unwrap();
        writer.write(&video(0, true), &[video_track()]).await.unwrap();

        // a non-empty directory where the sidecar should be renamed to
        let sidecar = writer.record.sidecar();
        std::fs::remove_file(&sidecar).unwrap();
        std::fs::create_dir_all(sidecar.join("blocked")).unwrap();

        let record = writer.close(None).await;
        assert_eq!(record.status, SegmentStatus::Incomplete);
        assert!(record.size_bytes > 0);
        assert_eq!(stream.open_recordings(), 0);
    }

    #[tokio::test]
    async fn test_open_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the stream directory should go
        let blocker = dir.path().join("live");
        std::fs::write(&blocker, b"x").unwrap();
        let stream = stream("cam1");
        let clock = MediaClock::new(Utc::now(), 0);
        let err = SegmentWriter::open_with_retry(&DiskFiles, dir.path(), &stream, TriggerReason::Event, clock, 0, 1)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Storage(_)));
        assert_eq!(stream.open_recordings(), 0);
    }
}
