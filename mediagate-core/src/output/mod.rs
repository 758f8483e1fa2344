//! Output adapters: per-protocol packagers that consume a stream's frame bus.
//!
//! Every client session gets its own [`FrameConsumer`]. Byte-oriented HTTP
//! outputs are driven by a spawned task that packages frames into a bounded
//! body channel; listener-driven outputs (RTSP, RTMP) take the consumer
//! itself and package on their own connection task.

pub mod flv;
pub mod fmp4;
pub mod hls;
pub mod rtmp;
pub mod rtsp;
pub mod ts;
pub mod webrtc;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use crate::{
    bus::{SubscribeOptions, Subscription},
    config::StreamingConfig,
    error::{GatewayError, Result},
    frame::{Frame, Protocol, TrackInfo},
    registry::StreamHandle,
    storage::SegmentStorage,
};

/// Chunks buffered between a packager task and the HTTP response.
const BODY_CHANNEL_CAPACITY: usize = 64;

/// Which outputs a stream may be played through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFlags {
    pub enable_rtsp: bool,
    /// Covers RTMP play and HTTP-FLV.
    pub enable_rtmp: bool,
    pub enable_hls: bool,
    pub enable_hls_fmp4: bool,
    pub enable_ts: bool,
    pub enable_fmp4: bool,
    pub enable_webrtc: bool,
}

impl Default for OutputFlags {
    fn default() -> Self {
        Self {
            enable_rtsp: true,
            enable_rtmp: true,
            enable_hls: true,
            enable_hls_fmp4: true,
            enable_ts: true,
            enable_fmp4: true,
            enable_webrtc: true,
        }
    }
}

impl OutputFlags {
    #[must_use]
    pub const fn allows(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Rtsp => self.enable_rtsp,
            Protocol::Rtmp | Protocol::Flv => self.enable_rtmp,
            Protocol::Hls => self.enable_hls,
            Protocol::HlsFmp4 => self.enable_hls_fmp4,
            Protocol::HttpTs => self.enable_ts,
            Protocol::HttpFmp4 => self.enable_fmp4,
            Protocol::WebRtc => self.enable_webrtc,
            Protocol::Record => true,
            Protocol::Rtp | Protocol::Gb28181 => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub start_at_keyframe: bool,
    /// Start from the cached GOP when one is available.
    pub replay_gop: bool,
    /// Re-attach from the next keyframe after an overrun instead of ending
    /// the session.
    pub resync_on_overrun: bool,
    pub queue_capacity: usize,
    /// SDP offer, WebRTC only.
    pub offer_sdp: Option<String>,
}

impl AttachOptions {
    #[must_use]
    pub const fn new(queue_capacity: usize) -> Self {
        Self {
            start_at_keyframe: true,
            replay_gop: true,
            resync_on_overrun: true,
            queue_capacity,
            offer_sdp: None,
        }
    }

    #[must_use]
    pub fn with_offer(mut self, sdp: impl Into<String>) -> Self {
        self.offer_sdp = Some(sdp.into());
        self
    }

    const fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            start_at_keyframe: self.start_at_keyframe,
            replay_gop: self.replay_gop,
            capacity: self.queue_capacity,
        }
    }
}

/// One client's view of a stream.
pub struct FrameConsumer {
    stream: StreamHandle,
    subscription: Subscription,
    capacity: usize,
    resync_on_overrun: bool,
    resyncs: u64,
    discontinuity: bool,
}

impl FrameConsumer {
    pub fn attach(stream: &StreamHandle, protocol: Protocol, options: &AttachOptions) -> Result<Self> {
        let subscription = stream.bus().subscribe(protocol, options.subscribe_options())?;
        debug!(stream = %stream.key(), consumer = subscription.id(), %protocol, "Consumer attached");
        Ok(Self {
            stream: Arc::clone(stream),
            subscription,
            capacity: options.queue_capacity,
            resync_on_overrun: options.resync_on_overrun,
            resyncs: 0,
            discontinuity: false,
        })
    }

    /// Next frame; `Ok(None)` once the stream ended.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.subscription.recv().await {
                Err(GatewayError::Overrun(reason)) if self.resync_on_overrun => {
                    let protocol = self.subscription.protocol();
                    warn!(
                        stream = %self.stream.key(),
                        consumer = self.subscription.id(),
                        %protocol,
                        %reason,
                        "Consumer overrun, resyncing from next keyframe"
                    );
                    match self
                        .stream
                        .bus()
                        .subscribe(protocol, SubscribeOptions::resync(self.capacity))
                    {
                        Ok(subscription) => self.subscription = subscription,
                        // the stream closed while we were behind
                        Err(_) => return Ok(None),
                    }
                    self.resyncs += 1;
                    self.discontinuity = true;
                }
                other => return other,
            }
        }
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.subscription.queued()
    }

    /// True once after every resync, so segmenters can mark the gap.
    pub fn take_discontinuity(&mut self) -> bool {
        std::mem::take(&mut self.discontinuity)
    }

    #[must_use]
    pub const fn resyncs(&self) -> u64 {
        self.resyncs
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.subscription.id()
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.subscription.protocol()
    }

    #[must_use]
    pub const fn stream(&self) -> &StreamHandle {
        &self.stream
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.stream.tracks()
    }

    pub fn detach(self) {
        debug!(stream = %self.stream.key(), consumer = self.id(), "Consumer detached");
    }
}

/// A continuous HTTP body. Dropping the receiver detaches the consumer.
pub struct ByteStream {
    pub content_type: &'static str,
    pub body: mpsc::Receiver<Bytes>,
}

pub enum OutputSession {
    /// FLV, MPEG-TS or fMP4 over a long-lived HTTP response.
    Body(ByteStream),
    /// Shared per-stream segmenter; playlists and segments are fetched from it.
    Hls(Arc<hls::HlsSession>),
    /// Raw frames for a listener that packages them per connection.
    Frames(FrameConsumer),
    WebRtc(webrtc::WebRtcAnswer),
}

impl std::fmt::Debug for OutputSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Body(body) => body.content_type,
            Self::Hls(_) => "hls",
            Self::Frames(_) => "frames",
            Self::WebRtc(_) => "webrtc",
        };
        f.debug_tuple("OutputSession").field(&kind).finish()
    }
}

#[async_trait]
pub trait OutputAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession>;
}

/// Turns frames into container bytes for one client.
pub trait Packager: Send + 'static {
    /// `tracks` is refreshed on every keyframe.
    fn push(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<Option<Bytes>>;

    /// Called once the stream has ended.
    fn finish(&mut self) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// Spawns the consumer task feeding an HTTP body.
pub fn spawn_body<P: Packager>(mut consumer: FrameConsumer, mut packager: P, content_type: &'static str) -> ByteStream {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let span = tracing::debug_span!(
        "consumer",
        stream = %consumer.stream().key(),
        consumer = consumer.id(),
        protocol = %consumer.protocol()
    );

    tokio::spawn(
        async move {
            let mut tracks = consumer.tracks();
            loop {
                let next = tokio::select! {
                    () = tx.closed() => break,
                    next = consumer.recv() => next,
                };
                let frame = match next {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        if let Ok(Some(tail)) = packager.finish() {
                            let _ = tx.send(tail).await;
                        }
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "Consumer ended");
                        break;
                    }
                };
                if frame.keyframe && frame.is_video() {
                    tracks = consumer.tracks();
                }
                match packager.push(&frame, &tracks) {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, seq = frame.seq, "Packaging failed, detaching consumer");
                        break;
                    }
                }
            }
            consumer.detach();
        }
        .instrument(span),
    );

    ByteStream { content_type, body: rx }
}

/// Attach point for every output protocol, keyed by [`Protocol`].
pub struct OutputRegistry {
    adapters: HashMap<Protocol, Arc<dyn OutputAdapter>>,
    hls: Arc<hls::HlsHub>,
    queue_capacity: usize,
}

impl OutputRegistry {
    #[must_use]
    pub fn new(config: &StreamingConfig, storage: Arc<dyn SegmentStorage>) -> Self {
        let hls = hls::HlsHub::new(config, storage);
        let mut registry = Self {
            adapters: HashMap::new(),
            hls: Arc::clone(&hls),
            queue_capacity: config.consumer_queue_capacity,
        };
        registry.register(Arc::new(flv::FlvOutput));
        registry.register(Arc::new(ts::TsOutput));
        registry.register(Arc::new(fmp4::Fmp4Output));
        registry.register(Arc::new(hls::HlsOutput::new(Arc::clone(&hls), hls::HlsVariant::Ts)));
        registry.register(Arc::new(hls::HlsOutput::new(hls, hls::HlsVariant::Fmp4)));
        registry.register(Arc::new(rtmp::RtmpOutput));
        registry.register(Arc::new(rtsp::RtspOutput));
        registry.register(Arc::new(webrtc::WebRtcOutput::new(config.webrtc_stun_servers.clone())));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn OutputAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    #[must_use]
    pub const fn hls(&self) -> &Arc<hls::HlsHub> {
        &self.hls
    }

    #[must_use]
    pub fn default_options(&self) -> AttachOptions {
        AttachOptions::new(self.queue_capacity)
    }

    pub async fn attach(
        &self,
        stream: &StreamHandle,
        protocol: Protocol,
        options: AttachOptions,
    ) -> Result<OutputSession> {
        if !stream.outputs().allows(protocol) {
            return Err(GatewayError::Unsupported(format!(
                "{protocol} output is disabled for {}",
                stream.key()
            )));
        }
        let adapter = self
            .adapters
            .get(&protocol)
            .ok_or_else(|| GatewayError::Unsupported(format!("{protocol} output")))?;
        adapter.attach(stream, options).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::RetentionPolicy,
        frame::{CodecTag, StreamKey},
        recording::PolicyStore,
        registry::Registry,
        storage::MemoryStorage,
    };

    pub(crate) const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF, 0xE5, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xF2, 0x3C, 0x58, 0xBA, 0x80];
    pub(crate) const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    pub(crate) fn video_track() -> TrackInfo {
        let mut config = Vec::new();
        for unit in [SPS, PPS] {
            config.extend_from_slice(&[0, 0, 0, 1]);
            config.extend_from_slice(unit);
        }
        TrackInfo::video(CodecTag::H264, Some(Bytes::from(config)))
    }

    pub(crate) fn aac_track() -> TrackInfo {
        TrackInfo::audio(CodecTag::Aac, 44_100, Some(Bytes::from_static(&[0x12, 0x10])))
    }

    pub(crate) fn video(ts: i64, keyframe: bool) -> Frame {
        let nal: &'static [u8] = if keyframe {
            &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00]
        } else {
            &[0, 0, 0, 1, 0x41, 0x9A, 0x02]
        };
        Frame::video(CodecTag::H264, ts, ts, keyframe, Bytes::from_static(nal))
    }

    pub(crate) fn audio(ts: i64) -> Frame {
        Frame::audio(CodecTag::Aac, ts, Bytes::from_static(&[0x21, 0x00, 0x49, 0x90]))
    }

    pub(crate) fn stream(name: &str) -> StreamHandle {
        let registry = Registry::init(1, Arc::new(PolicyStore::new(RetentionPolicy::default())));
        let stream = registry.register(&StreamKey::new("live", name).unwrap()).unwrap();
        stream.bus().set_tracks(vec![video_track(), aac_track()]);
        stream
    }

    fn outputs() -> OutputRegistry {
        OutputRegistry::new(&StreamingConfig::default(), Arc::new(MemoryStorage::with_limit(0)))
    }

    #[tokio::test]
    async fn test_disabled_output_is_unsupported() {
        let stream = stream("cam1");
        stream.set_outputs(OutputFlags {
            enable_ts: false,
            ..OutputFlags::default()
        });
        let registry = outputs();
        let err = registry
            .attach(&stream, Protocol::HttpTs, registry.default_options())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported(_)));
        assert!(registry
            .attach(&stream, Protocol::Gb28181, registry.default_options())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_consumer_resyncs_after_overrun() {
        let stream = stream("cam1");
        let options = AttachOptions {
            replay_gop: false,
            ..AttachOptions::new(2)
        };
        let mut consumer = FrameConsumer::attach(&stream, Protocol::Rtmp, &options).unwrap();
        for i in 0..5 {
            stream.bus().publish(video(i * 40, i == 0));
        }
        assert_eq!(consumer.recv().await.unwrap().unwrap().seq, 0);
        assert_eq!(consumer.recv().await.unwrap().unwrap().seq, 1);

        // overrun detected after the drain; the resubscription waits for a keyframe
        let bus = Arc::clone(stream.bus());
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            bus.publish(video(200, false));
            bus.publish(video(240, true));
        });
        let frame = consumer.recv().await.unwrap().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.pts_ms, 240);
        assert_eq!(consumer.resyncs(), 1);
        assert!(consumer.take_discontinuity());
        assert!(!consumer.take_discontinuity());
    }

    #[tokio::test]
    async fn test_overrun_without_resync_ends_session() {
        let stream = stream("cam1");
        let options = AttachOptions {
            replay_gop: false,
            resync_on_overrun: false,
            ..AttachOptions::new(1)
        };
        let mut consumer = FrameConsumer::attach(&stream, Protocol::WebRtc, &options).unwrap();
        stream.bus().publish(video(0, true));
        stream.bus().publish(video(40, false));
        assert!(consumer.recv().await.unwrap().is_some());
        assert!(matches!(consumer.recv().await, Err(GatewayError::Overrun(_))));
    }

    #[tokio::test]
    async fn test_body_ends_when_stream_closes() {
        let stream = stream("cam1");
        let registry = outputs();
        let session = registry
            .attach(&stream, Protocol::Flv, registry.default_options())
            .await
            .unwrap();
        let OutputSession::Body(mut body) = session else {
            panic!("expected a body");
        };
        assert_eq!(body.content_type, "video/x-flv");
        stream.bus().publish(video(0, true));
        let first = body.body.recv().await.unwrap();
        assert_eq!(&first[..3], b"FLV");
        stream.close();
        while body.body.recv().await.is_some() {}
        assert_eq!(stream.bus().viewer_count(), 0);
    }
}
