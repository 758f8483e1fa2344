//! Ingest adapters: protocol receivers that turn a remote source into
//! [`Frame`]s on a stream's bus.
//!
//! An [`IngestAdapter`] connects and hands back a [`FrameSource`]; the
//! [`IngestHandle`] owns the connect / pump / backoff loop around it.

pub mod flv;
pub mod gb28181;
pub mod http_flv;
pub mod rtmp;
pub mod rtp;
pub mod rtsp;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    config::{IngestConfig, StreamingConfig},
    error::{GatewayError, Result},
    frame::{Frame, Protocol, TrackInfo},
    registry::{SourceInfo, StreamEvent, StreamHandle, StreamState},
    util,
};

/// How RTP is carried, numbered like the `rtp_type` field of pull proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtpTransport {
    #[default]
    Tcp,
    Udp,
    Multicast,
}

impl RtpTransport {
    #[must_use]
    pub const fn from_rtp_type(rtp_type: u8) -> Self {
        match rtp_type {
            1 => Self::Udp,
            2 => Self::Multicast,
            _ => Self::Tcp,
        }
    }
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub transport: RtpTransport,
    /// Connect timeout; 0 uses `ingest.connect_timeout_seconds`.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// `-1` retries forever, `0` uses `ingest.max_attempts`.
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default = "default_true")]
    pub enable_audio: bool,
    /// Rebase timestamps so the first frame starts at zero.
    #[serde(default)]
    pub rebase_timestamps: bool,
}

impl SourceConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: RtpTransport::Tcp,
            timeout_seconds: 0,
            retry_count: 0,
            enable_audio: true,
            rebase_timestamps: false,
        }
    }

    /// Protocol implied by the url scheme.
    pub fn protocol(&self) -> Result<Protocol> {
        let scheme = self
            .url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| GatewayError::InvalidInput(format!("source url has no scheme: {}", self.url)))?;
        match scheme.as_str() {
            "rtsp" | "rtsps" => Ok(Protocol::Rtsp),
            "rtmp" | "rtmps" => Ok(Protocol::Rtmp),
            "rtp" => Ok(Protocol::Rtp),
            "http" | "https" => Ok(Protocol::Flv),
            other => Err(GatewayError::Unsupported(format!("source scheme {other}"))),
        }
    }
}

#[async_trait]
pub trait FrameSource: Send {
    fn tracks(&self) -> Vec<TrackInfo>;

    /// Tracks learned mid-stream (e.g. RTMP sequence headers), if changed
    /// since the last call.
    fn take_track_update(&mut self) -> Option<Vec<TrackInfo>> {
        None
    }

    /// `Ok(None)` when the source ended cleanly. A `Protocol` error means
    /// one unit was dropped and the source is still usable; any other
    /// error ends the connection.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Best-effort goodbye to the remote side.
    async fn close(&mut self) {}
}

#[async_trait]
pub trait IngestAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn connect(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>>;
}

/// Picks the adapter for a source url.
pub fn adapter_for(config: &SourceConfig) -> Result<Arc<dyn IngestAdapter>> {
    Ok(match config.protocol()? {
        Protocol::Rtsp => Arc::new(rtsp::RtspIngest),
        Protocol::Rtmp => Arc::new(rtmp::RtmpIngest),
        Protocol::Rtp => Arc::new(rtp::RtpIngest),
        Protocol::Flv => Arc::new(http_flv::HttpFlvIngest::new()),
        other => return Err(GatewayError::Unsupported(format!("{other} ingest"))),
    })
}

/// Retry and timeout knobs for one ingest.
#[derive(Debug, Clone, Copy)]
pub struct IngestRuntime {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub rebase_timestamps: bool,
}

impl IngestRuntime {
    #[must_use]
    pub fn new(ingest: &IngestConfig, streaming: &StreamingConfig, source: &SourceConfig) -> Self {
        let max_attempts = match source.retry_count {
            n if n < 0 => None,
            0 => Some(ingest.max_attempts.max(1)),
            n => Some(n.unsigned_abs()),
        };
        let connect_timeout = if source.timeout_seconds > 0 {
            source.timeout_seconds
        } else {
            ingest.connect_timeout_seconds
        };
        Self {
            max_attempts,
            backoff_base_ms: ingest.backoff_base_ms,
            backoff_max_ms: ingest.backoff_max_ms,
            connect_timeout: Duration::from_secs(connect_timeout.max(1)),
            io_timeout: Duration::from_secs(streaming.io_timeout_seconds.max(1)),
            rebase_timestamps: source.rebase_timestamps,
        }
    }
}

#[derive(Debug)]
enum PumpEnd {
    Cancelled,
    Ended,
    Failed(GatewayError),
}

/// Shifts timestamps so the first frame lands on zero.
#[derive(Debug, Default)]
struct Rebaser {
    origin: Option<i64>,
}

impl Rebaser {
    fn apply(&mut self, frame: &mut Frame) {
        let origin = *self.origin.get_or_insert(frame.dts_ms);
        frame.pts_ms -= origin;
        frame.dts_ms -= origin;
    }
}

async fn pump(
    stream: &StreamHandle,
    source: &mut dyn FrameSource,
    cancel: &CancellationToken,
    runtime: &IngestRuntime,
) -> PumpEnd {
    stream.bus().set_tracks(source.tracks());
    let mut rebaser = runtime.rebase_timestamps.then(Rebaser::default);

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return PumpEnd::Cancelled,
            next = tokio::time::timeout(runtime.io_timeout, source.next_frame()) => next,
        };
        match next {
            Err(_) => {
                return PumpEnd::Failed(GatewayError::Transport(format!(
                    "no media for {:?}",
                    runtime.io_timeout
                )))
            }
            Ok(Ok(Some(mut frame))) => {
                if let Some(tracks) = source.take_track_update() {
                    stream.bus().set_tracks(tracks);
                }
                if let Some(rebaser) = rebaser.as_mut() {
                    rebaser.apply(&mut frame);
                }
                if stream.bus().publish(frame).is_none() {
                    return PumpEnd::Cancelled;
                }
            }
            Ok(Ok(None)) => return PumpEnd::Ended,
            Ok(Err(GatewayError::Protocol(reason))) => {
                let total = stream.count_corrupt();
                debug!(stream = %stream.key(), %reason, total, "Dropped corrupt media unit");
            }
            Ok(Err(e)) => return PumpEnd::Failed(e),
        }
    }
}

/// A running ingest. Dropping the handle does not stop it; call
/// [`Self::stop`].
pub struct IngestHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    io_timeout: Duration,
}

impl IngestHandle {
    /// Pull ingest: connect, pump, and reconnect with backoff until
    /// cancelled or out of attempts.
    pub fn start(
        stream: StreamHandle,
        adapter: Arc<dyn IngestAdapter>,
        source: SourceConfig,
        runtime: IngestRuntime,
    ) -> Self {
        let cancel = stream.cancel_token().child_token();
        let token = cancel.clone();
        let span = tracing::info_span!("stream", key = %stream.key(), protocol = %adapter.protocol());
        stream.set_source(Some(SourceInfo {
            protocol: adapter.protocol(),
            origin: source.url.clone(),
        }));

        let task = tokio::spawn(
            async move {
                let mut attempt: u32 = 0;
                loop {
                    stream.set_state(StreamState::Starting);
                    let connected = tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        connected = tokio::time::timeout(runtime.connect_timeout, adapter.connect(&source)) => connected,
                    };

                    let failure = match connected {
                        Ok(Ok(mut frames)) => {
                            attempt = 0;
                            stream.set_state(StreamState::Active);
                            info!(url = %source.url, tracks = frames.tracks().len(), "Ingest connected");
                            let end = pump(&stream, frames.as_mut(), &token, &runtime).await;
                            frames.close().await;
                            match end {
                                PumpEnd::Cancelled => break,
                                PumpEnd::Ended => GatewayError::Transport("source ended".to_string()),
                                PumpEnd::Failed(e) => e,
                            }
                        }
                        Ok(Err(e)) => e,
                        Err(_) => GatewayError::Transport(format!(
                            "connect timed out after {:?}",
                            runtime.connect_timeout
                        )),
                    };

                    attempt += 1;
                    if runtime.max_attempts.is_some_and(|max| attempt >= max) {
                        error!(attempt, error = %failure, "Ingest failed, giving up");
                        stream.set_state(StreamState::Failed);
                        stream.emit(StreamEvent::IngestFailed(failure.to_string()));
                        stream.bus().close();
                        break;
                    }
                    warn!(attempt, error = %failure, "Ingest interrupted, reconnecting");
                    if !util::backoff(attempt, runtime.backoff_base_ms, runtime.backoff_max_ms, &token).await {
                        break;
                    }
                }
                debug!("Ingest loop exited");
            }
            .instrument(span),
        );

        Self {
            cancel,
            task,
            io_timeout: runtime.io_timeout,
        }
    }

    /// Push ingest: the connection was accepted by a listener, so there is
    /// nothing to reconnect. The stream goes back to `Idle` when the
    /// publisher leaves.
    pub fn run_source(
        stream: StreamHandle,
        mut source: Box<dyn FrameSource>,
        origin: SourceInfo,
        runtime: IngestRuntime,
    ) -> Self {
        let cancel = stream.cancel_token().child_token();
        let token = cancel.clone();
        let span = tracing::info_span!("stream", key = %stream.key(), protocol = %origin.protocol);
        stream.set_source(Some(origin));

        let task = tokio::spawn(
            async move {
                stream.set_state(StreamState::Active);
                let end = pump(&stream, source.as_mut(), &token, &runtime).await;
                source.close().await;
                match end {
                    PumpEnd::Failed(e) => warn!(error = %e, "Publisher lost"),
                    PumpEnd::Ended => info!("Publisher finished"),
                    PumpEnd::Cancelled => debug!("Publish cancelled"),
                }
                if !stream.is_closed() {
                    stream.set_state(StreamState::Idle);
                }
            }
            .instrument(span),
        );

        Self {
            cancel,
            task,
            io_timeout: runtime.io_timeout,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cooperative stop, bounded by one I/O timeout.
    pub async fn stop(self) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(self.io_timeout, &mut task).await.is_err() {
            warn!("Ingest did not stop in time, aborting");
            task.abort();
        }
    }

    /// Waits for the ingest to finish on its own.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        bus::SubscribeOptions,
        config::RetentionPolicy,
        frame::{CodecTag, StreamKey},
        recording::PolicyStore,
        registry::Registry,
    };
    use bytes::Bytes;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicU32, Ordering},
    };

    /// Scripted source used by ingest and session tests.
    pub(crate) struct ScriptedSource {
        pub items: VecDeque<Result<Option<Frame>>>,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        fn tracks(&self) -> Vec<TrackInfo> {
            vec![TrackInfo::video(CodecTag::H264, None)]
        }

        async fn next_frame(&mut self) -> Result<Option<Frame>> {
            match self.items.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }
    }

    struct FlakyAdapter {
        connects: Arc<AtomicU32>,
    }

    #[async_trait]
    impl IngestAdapter for FlakyAdapter {
        fn protocol(&self) -> Protocol {
            Protocol::Rtsp
        }

        async fn connect(&self, _config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(GatewayError::Transport("connection refused".to_string()));
            }
            let mut items = VecDeque::new();
            items.push_back(Ok(Some(Frame::video(CodecTag::H264, 0, 0, true, Bytes::from_static(&[1])))));
            items.push_back(Err(GatewayError::Protocol("bad fu-a".to_string())));
            items.push_back(Ok(Some(Frame::video(CodecTag::H264, 40, 40, false, Bytes::from_static(&[2])))));
            Ok(Box::new(ScriptedSource { items }))
        }
    }

    fn runtime(max_attempts: Option<u32>) -> IngestRuntime {
        IngestRuntime {
            max_attempts,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(5),
            rebase_timestamps: false,
        }
    }

    fn stream() -> StreamHandle {
        let registry = Registry::init(1, Arc::new(PolicyStore::new(RetentionPolicy::default())));
        registry.register(&StreamKey::new("live", "cam1").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_reconnect_then_frames_and_corruption_counter() {
        let stream = stream();
        let mut sub = stream
            .bus()
            .subscribe(Protocol::Hls, SubscribeOptions::live(16))
            .unwrap();
        let connects = Arc::new(AtomicU32::new(0));
        let handle = IngestHandle::start(
            Arc::clone(&stream),
            Arc::new(FlakyAdapter {
                connects: Arc::clone(&connects),
            }),
            SourceConfig::new("rtsp://10.0.0.2/live"),
            runtime(Some(5)),
        );

        let first = sub.recv().await.unwrap().unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(second.pts_ms, 40);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(stream.corrupt_frames(), 1);
        assert_eq!(stream.state(), StreamState::Active);
        assert_eq!(stream.source().unwrap().protocol, Protocol::Rtsp);

        handle.stop().await;
    }

    struct DeadAdapter;

    #[async_trait]
    impl IngestAdapter for DeadAdapter {
        fn protocol(&self) -> Protocol {
            Protocol::Rtmp
        }

        async fn connect(&self, _config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
            Err(GatewayError::Transport("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_exhaustion_fails_stream_and_ends_consumers() {
        let stream = stream();
        let mut events = stream.subscribe_events();
        let mut sub = stream
            .bus()
            .subscribe(Protocol::Flv, SubscribeOptions::live(16))
            .unwrap();
        let handle = IngestHandle::start(
            Arc::clone(&stream),
            Arc::new(DeadAdapter),
            SourceConfig::new("rtmp://10.0.0.2/live/cam"),
            runtime(Some(3)),
        );
        handle.join().await;

        assert_eq!(stream.state(), StreamState::Failed);
        assert!(sub.recv().await.unwrap().is_none());
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, StreamEvent::IngestFailed(_));
        }
        assert!(saw_failure);
    }

    #[test]
    fn test_source_config_defaults() {
        let config: SourceConfig = serde_json::from_str(r#"{"url": "rtsp://h/s"}"#).unwrap();
        assert!(config.enable_audio);
        assert_eq!(config.protocol().unwrap(), Protocol::Rtsp);
        assert_eq!(SourceConfig::new("https://h/a.flv").protocol().unwrap(), Protocol::Flv);
        assert!(SourceConfig::new("srt://h").protocol().is_err());
        assert_eq!(RtpTransport::from_rtp_type(1), RtpTransport::Udp);

        let runtime = IngestRuntime::new(
            &IngestConfig::default(),
            &StreamingConfig::default(),
            &SourceConfig {
                retry_count: -1,
                ..config
            },
        );
        assert!(runtime.max_attempts.is_none());
    }

    #[test]
    fn test_rebaser() {
        let mut rebaser = Rebaser::default();
        let mut frame = Frame::video(CodecTag::H264, 5040, 5000, true, Bytes::new());
        rebaser.apply(&mut frame);
        assert_eq!((frame.pts_ms, frame.dts_ms), (40, 0));
    }
}
