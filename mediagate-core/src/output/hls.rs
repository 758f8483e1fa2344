//! On-demand HLS (MPEG-TS and fMP4 variants).
//!
//! A segmenter is started by the first playlist request for a stream and
//! shared by every HLS client of it. It cuts segments on keyframes, writes
//! them to [`SegmentStorage`] and stops once nobody has asked for the
//! playlist or a segment for the idle timeout.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use mediagate_media::hls::MediaPlaylist;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{fmp4::Fmp4Fragmenter, ts::TsPackager, AttachOptions, FrameConsumer, OutputAdapter, OutputSession};
use crate::{
    config::StreamingConfig,
    error::{GatewayError, Result},
    frame::{CodecTag, Frame, Protocol, StreamKey, TrackInfo, TrackKind},
    registry::StreamHandle,
    storage::SegmentStorage,
};

const INIT_SEGMENT: &str = "init.mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HlsVariant {
    Ts,
    Fmp4,
}

impl HlsVariant {
    #[must_use]
    pub const fn protocol(self) -> Protocol {
        match self {
            Self::Ts => Protocol::Hls,
            Self::Fmp4 => Protocol::HlsFmp4,
        }
    }

    #[must_use]
    pub const fn playlist_name(self) -> &'static str {
        match self {
            Self::Ts => "hls.m3u8",
            Self::Fmp4 => "hls.fmp4.m3u8",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Fmp4 => "m4s",
        }
    }

    #[must_use]
    pub const fn segment_content_type(self) -> &'static str {
        match self {
            Self::Ts => "video/mp2t",
            Self::Fmp4 => "video/mp4",
        }
    }
}

enum Muxer {
    Ts(TsPackager),
    Fmp4(Fmp4Fragmenter),
}

/// A segment ready to be stored.
#[derive(Debug)]
struct ClosedSegment {
    duration_ms: i64,
    discontinuity: bool,
    data: Bytes,
}

/// Cuts frames into keyframe-aligned segments. Pure; storage is handled by
/// the session.
struct Segmenter {
    muxer: Muxer,
    target_ms: i64,
    started: bool,
    has_video: bool,
    buffer: BytesMut,
    segment_start: Option<i64>,
    discontinuity: bool,
}

impl Segmenter {
    fn new(variant: HlsVariant, target_ms: i64) -> Self {
        Self {
            muxer: match variant {
                HlsVariant::Ts => Muxer::Ts(TsPackager::new()),
                HlsVariant::Fmp4 => Muxer::Fmp4(Fmp4Fragmenter::new()),
            },
            target_ms: target_ms.max(1),
            started: false,
            has_video: false,
            buffer: BytesMut::new(),
            segment_start: None,
            discontinuity: false,
        }
    }

    /// Marks a gap in the frame sequence: the next frame opens a new
    /// segment flagged as a discontinuity.
    fn mark_discontinuity(&mut self) {
        self.discontinuity = true;
    }

    /// Feeds one frame. Returns the init segment the first time output
    /// starts (fMP4 only) and any segment the frame closed.
    fn push(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<(Option<Bytes>, Option<ClosedSegment>)> {
        let mut init = None;
        if !self.started {
            self.has_video = tracks.iter().any(|t| t.kind == TrackKind::Video) || frame.is_video();
            if self.has_video && !(frame.is_video() && frame.keyframe) {
                return Ok((None, None));
            }
            if let Muxer::Fmp4(fragmenter) = &mut self.muxer {
                match fragmenter.init_segment(tracks)? {
                    Some(segment) => init = Some(segment),
                    None => return Ok((None, None)),
                }
            }
            self.started = true;
        }

        let boundary = frame.keyframe && (frame.is_video() || !self.has_video);
        let due = self
            .segment_start
            .is_some_and(|start| frame.dts_ms - start >= self.target_ms || self.discontinuity);
        let cut = boundary && due;
        let mut closed = None;

        match &mut self.muxer {
            Muxer::Ts(packager) => {
                if cut {
                    closed = close_segment(&mut self.buffer, &mut self.segment_start, &mut self.discontinuity, frame.dts_ms);
                }
                if packager_write(packager, frame, tracks, &mut self.buffer)? {
                    self.segment_start.get_or_insert(frame.dts_ms);
                }
            }
            Muxer::Fmp4(fragmenter) => {
                // the keyframe completes the previous sample and stays pending
                fragmenter.push(frame);
                if cut {
                    if let Some(fragment) = fragmenter.fragment()? {
                        self.buffer.extend_from_slice(&fragment);
                    }
                    closed = close_segment(&mut self.buffer, &mut self.segment_start, &mut self.discontinuity, frame.dts_ms);
                }
                self.segment_start.get_or_insert(frame.dts_ms);
            }
        }
        Ok((init, closed))
    }

    /// Flushes the open segment when the stream ends.
    fn finish(&mut self, end_ms: i64) -> Result<Option<ClosedSegment>> {
        if let Muxer::Fmp4(fragmenter) = &mut self.muxer {
            if let Some(fragment) = fragmenter.finish()? {
                self.buffer.extend_from_slice(&fragment);
            }
        }
        Ok(close_segment(&mut self.buffer, &mut self.segment_start, &mut self.discontinuity, end_ms))
    }
}

fn close_segment(
    buffer: &mut BytesMut,
    segment_start: &mut Option<i64>,
    discontinuity: &mut bool,
    end_ms: i64,
) -> Option<ClosedSegment> {
    let start = segment_start.take()?;
    if buffer.is_empty() {
        return None;
    }
    Some(ClosedSegment {
        duration_ms: (end_ms - start).max(1),
        discontinuity: std::mem::take(discontinuity),
        data: buffer.split().freeze(),
    })
}

fn packager_write(packager: &mut TsPackager, frame: &Frame, tracks: &[TrackInfo], out: &mut BytesMut) -> Result<bool> {
    let written = packager.write(frame, tracks)?;
    out.extend_from_slice(&packager.take());
    Ok(written)
}

struct PlaylistState {
    playlist: MediaPlaylist,
    next_index: u64,
    last_dts: i64,
}

/// One running segmenter for a stream and variant.
pub struct HlsSession {
    key: StreamKey,
    variant: HlsVariant,
    stream: StreamHandle,
    prefix: String,
    storage: Arc<dyn SegmentStorage>,
    state: Mutex<PlaylistState>,
    segments: watch::Sender<u64>,
    last_access: Mutex<Instant>,
    cancel: CancellationToken,
}

impl HlsSession {
    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    #[must_use]
    pub const fn variant(&self) -> HlsVariant {
        self.variant
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn storage_key(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    /// Renders the playlist once the first segment exists, waiting up to
    /// `wait` for it.
    pub async fn playlist(&self, wait: Duration) -> Result<String> {
        self.touch();
        let mut segments = self.segments.subscribe();
        let ready = tokio::time::timeout(wait, segments.wait_for(|count| *count > 0)).await;
        if !matches!(ready, Ok(Ok(_))) {
            return Err(GatewayError::NotFound(format!(
                "{} has no {} segment yet",
                self.key,
                self.variant.extension()
            )));
        }
        let state = self.state.lock();
        Ok(state.playlist.render(|name| name.to_string()))
    }

    /// A segment (or the fMP4 init section) by name.
    pub async fn segment(&self, name: &str) -> Result<Bytes> {
        self.touch();
        let known = {
            let state = self.state.lock();
            state.playlist.contains(name) || state.playlist.init_segment.as_deref() == Some(name)
        };
        if !known {
            return Err(GatewayError::NotFound(format!("segment {name} of {}", self.key)));
        }
        self.storage.read(&self.storage_key(name)).await
    }

    async fn store_init(&self, data: Bytes) -> Result<()> {
        self.storage.write(&self.storage_key(INIT_SEGMENT), data).await?;
        self.state.lock().playlist.init_segment = Some(INIT_SEGMENT.to_string());
        Ok(())
    }

    async fn store_segment(&self, segment: ClosedSegment) -> Result<()> {
        let name = {
            let mut state = self.state.lock();
            let name = format!("{}.{}", state.next_index, self.variant.extension());
            state.next_index += 1;
            name
        };
        self.storage.write(&self.storage_key(&name), segment.data).await?;
        let evicted = {
            let mut state = self.state.lock();
            state.playlist.push(name.clone(), segment.duration_ms, segment.discontinuity)
        };
        for old in evicted {
            if let Err(e) = self.storage.delete(&self.storage_key(&old)).await {
                warn!(segment = %old, error = %e, "Failed to delete evicted HLS segment");
            }
        }
        self.segments.send_modify(|count| *count += 1);
        debug!(segment = %name, duration_ms = segment.duration_ms, "HLS segment written");
        Ok(())
    }

    async fn remove_all(&self) {
        let names: Vec<String> = {
            let state = self.state.lock();
            state
                .playlist
                .segments
                .iter()
                .map(|s| s.name.clone())
                .chain(state.playlist.init_segment.clone())
                .collect()
        };
        for name in names {
            let _ = self.storage.delete(&self.storage_key(&name)).await;
        }
    }

    async fn run(self: Arc<Self>, mut consumer: FrameConsumer, target_ms: i64, idle_timeout: Duration) {
        let mut segmenter = Segmenter::new(self.variant, target_ms);
        let mut tracks = consumer.tracks();
        let mut live = true;
        let mut idle_check = tokio::time::interval((idle_timeout / 4).max(Duration::from_millis(100)));

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = idle_check.tick() => {
                    if self.idle_for() >= idle_timeout {
                        info!("HLS segmenter idle, stopping");
                        break;
                    }
                }
                next = consumer.recv(), if live => match next {
                    Ok(Some(frame)) => {
                        if consumer.take_discontinuity() {
                            segmenter.mark_discontinuity();
                        }
                        if frame.keyframe && frame.is_video() {
                            tracks = consumer.tracks();
                        }
                        self.state.lock().last_dts = frame.dts_ms;
                        match segmenter.push(&frame, &tracks) {
                            Ok((init, closed)) => {
                                if let Some(init) = init {
                                    if let Err(e) = self.store_init(init).await {
                                        warn!(error = %e, "Failed to store HLS init segment");
                                    }
                                }
                                if let Some(segment) = closed {
                                    if let Err(e) = self.store_segment(segment).await {
                                        warn!(error = %e, "Failed to store HLS segment");
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, seq = frame.seq, "HLS packaging failed"),
                        }
                    }
                    Ok(None) | Err(_) => {
                        live = false;
                        let end = self.state.lock().last_dts;
                        match segmenter.finish(end) {
                            Ok(Some(segment)) => {
                                if let Err(e) = self.store_segment(segment).await {
                                    warn!(error = %e, "Failed to store final HLS segment");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "HLS packaging failed"),
                        }
                        self.state.lock().playlist.ended = true;
                        debug!("Stream ended, playlist closed");
                    }
                },
            }
        }

        self.cancel.cancel();
        consumer.detach();
        self.remove_all().await;
    }
}

/// All HLS segmenters of the process, keyed by stream and variant.
pub struct HlsHub {
    sessions: DashMap<(StreamKey, HlsVariant), Arc<HlsSession>>,
    storage: Arc<dyn SegmentStorage>,
    segment_duration_ms: i64,
    playlist_length: usize,
    idle_timeout: Duration,
}

impl HlsHub {
    #[must_use]
    pub fn new(config: &StreamingConfig, storage: Arc<dyn SegmentStorage>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            storage,
            segment_duration_ms: config.hls_segment_duration_ms,
            playlist_length: config.hls_playlist_length,
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds.max(1)),
        })
    }

    /// How long a playlist request may wait for the first segment.
    #[must_use]
    pub fn first_segment_wait(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.segment_duration_ms.max(1000)).unwrap_or(4000) * 2)
    }

    /// The running segmenter for the stream, started if needed.
    pub fn session(self: &Arc<Self>, stream: &StreamHandle, variant: HlsVariant, options: &AttachOptions) -> Result<Arc<HlsSession>> {
        let id = (stream.key().clone(), variant);
        if let Some(existing) = self.sessions.get(&id) {
            if !existing.is_finished() && Arc::ptr_eq(&existing.stream, stream) {
                existing.touch();
                return Ok(Arc::clone(existing.value()));
            }
        }

        let consumer = FrameConsumer::attach(stream, variant.protocol(), options)?;
        let session = Arc::new(HlsSession {
            key: stream.key().clone(),
            variant,
            stream: Arc::clone(stream),
            prefix: format!("{}/{}/{}", stream.key(), variant.extension(), nanoid::nanoid!(8)),
            storage: Arc::clone(&self.storage),
            state: Mutex::new(PlaylistState {
                playlist: MediaPlaylist::new(self.playlist_length, None),
                next_index: 0,
                last_dts: 0,
            }),
            segments: watch::channel(0).0,
            last_access: Mutex::new(Instant::now()),
            // not tied to the stream: an ended stream keeps its closed
            // playlist until the idle timeout
            cancel: CancellationToken::new(),
        });

        let span = tracing::info_span!("hls", stream = %stream.key(), variant = ?variant);
        let hub: Weak<Self> = Arc::downgrade(self);
        let runner = Arc::clone(&session);
        let (target, idle) = (self.segment_duration_ms, self.idle_timeout);
        tokio::spawn(
            async move {
                let key = (runner.key.clone(), runner.variant);
                Arc::clone(&runner).run(consumer, target, idle).await;
                if let Some(hub) = hub.upgrade() {
                    hub.sessions.remove_if(&key, |_, current| Arc::ptr_eq(current, &runner));
                }
            }
            .instrument(span),
        );

        info!(stream = %stream.key(), ?variant, "HLS segmenter started");
        self.sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, key: &StreamKey, variant: HlsVariant) -> Option<Arc<HlsSession>> {
        self.sessions
            .get(&(key.clone(), variant))
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| !session.is_finished())
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub fn stop_all(&self) {
        for entry in &self.sessions {
            entry.value().stop();
        }
    }
}

pub struct HlsOutput {
    hub: Arc<HlsHub>,
    variant: HlsVariant,
}

impl HlsOutput {
    #[must_use]
    pub const fn new(hub: Arc<HlsHub>, variant: HlsVariant) -> Self {
        Self { hub, variant }
    }
}

#[async_trait]
impl OutputAdapter for HlsOutput {
    fn protocol(&self) -> Protocol {
        self.variant.protocol()
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        let tracks = stream.tracks();
        if self.variant == HlsVariant::Fmp4
            && !tracks.is_empty()
            && !tracks.iter().any(|t| matches!(t.codec, CodecTag::H264 | CodecTag::Aac))
        {
            return Err(GatewayError::Unsupported(format!(
                "{} has no track that fits in fMP4",
                stream.key()
            )));
        }
        Ok(OutputSession::Hls(self.hub.session(stream, self.variant, &options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        output::tests::{audio, stream, video},
        storage::MemoryStorage,
    };

    fn hub(idle_timeout_seconds: u64) -> (Arc<HlsHub>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::with_limit(0));
        let config = StreamingConfig {
            hls_segment_duration_ms: 1000,
            hls_playlist_length: 3,
            idle_timeout_seconds,
            ..StreamingConfig::default()
        };
        (HlsHub::new(&config, Arc::clone(&storage) as Arc<dyn SegmentStorage>), storage)
    }

    fn publish_gops(stream: &StreamHandle, gops: i64) {
        for gop in 0..gops {
            for i in 0..25 {
                let ts = gop * 1000 + i * 40;
                stream.bus().publish(video(ts, i == 0));
                stream.bus().publish(audio(ts + 5));
            }
        }
    }

    #[test]
    fn test_segmenter_cuts_on_keyframes() {
        let tracks = vec![crate::output::tests::video_track()];
        let mut segmenter = Segmenter::new(HlsVariant::Ts, 1000);
        // leading delta frames are dropped
        let (_, closed) = segmenter.push(&video(0, false), &tracks).unwrap();
        assert!(closed.is_none());
        assert!(!segmenter.started);

        let mut segments = Vec::new();
        for i in 1..=100 {
            let ts = i * 40;
            // keyframe every 30 frames (1.2 s)
            let (_, closed) = segmenter.push(&video(ts, (i - 1) % 30 == 0), &tracks).unwrap();
            segments.extend(closed);
        }
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.duration_ms == 1200));
        assert!(segments.iter().all(|s| s.data[0] == 0x47));
        assert!(segmenter.finish(4000).unwrap().is_some());
    }

    #[test]
    fn test_fmp4_segmenter_emits_init_once() {
        let tracks = vec![crate::output::tests::video_track(), crate::output::tests::aac_track()];
        let mut segmenter = Segmenter::new(HlsVariant::Fmp4, 1000);
        let (init, _) = segmenter.push(&video(0, true), &tracks).unwrap();
        assert!(init.is_some());
        let mut closed = Vec::new();
        for i in 1..=50 {
            let (init, segment) = segmenter.push(&video(i * 40, i % 25 == 0), &tracks).unwrap();
            assert!(init.is_none());
            closed.extend(segment);
        }
        assert_eq!(closed.len(), 2);
        assert_eq!(&closed[0].data[4..8], b"moof");
    }

    #[tokio::test]
    async fn test_playlist_and_segments_served() {
        let (hub, storage) = hub(30);
        let stream = stream("cam1");
        let output = HlsOutput::new(Arc::clone(&hub), HlsVariant::Ts);
        let OutputSession::Hls(session) = output.attach(&stream, AttachOptions::new(4096)).await.unwrap() else {
            panic!("expected an HLS session");
        };
        publish_gops(&stream, 4);

        let playlist = session.playlist(Duration::from_secs(5)).await.unwrap();
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("0.ts"));

        // same session for the next client
        let again = hub.session(&stream, HlsVariant::Ts, &AttachOptions::new(16)).unwrap();
        assert!(Arc::ptr_eq(&again, &session));

        let segment = session.segment("0.ts").await.unwrap();
        assert_eq!(segment[0], 0x47);
        assert!(matches!(session.segment("99.ts").await, Err(GatewayError::NotFound(_))));
        assert!(storage.len() >= 1);

        stream.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.state.lock().playlist.ended {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(session.playlist(Duration::from_secs(1)).await.unwrap().contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_segmenter_stops_and_cleans_up() {
        let (hub, storage) = hub(2);
        let stream = stream("cam2");
        let session = hub.session(&stream, HlsVariant::Ts, &AttachOptions::new(4096)).unwrap();
        publish_gops(&stream, 3);
        session.playlist(Duration::from_secs(1)).await.unwrap();
        assert!(storage.len() > 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(session.is_finished());
        assert!(hub.get(stream.key(), HlsVariant::Ts).is_none());
        assert_eq!(storage.len(), 0);
        assert_eq!(stream.bus().viewer_count(), 0);
    }
}
