//! WebRTC play. The client POSTs an SDP offer and gets an answer with all
//! ICE candidates inlined; media then flows over the negotiated peer
//! connection until either side goes away.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mediagate_media::h264;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_PCMA, MIME_TYPE_PCMU},
        APIBuilder,
    },
    ice_transport::ice_server::RTCIceServer,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use super::{AttachOptions, FrameConsumer, OutputAdapter, OutputSession};
use crate::{
    error::{GatewayError, Result},
    frame::{CodecTag, Frame, Protocol, TrackInfo},
    registry::StreamHandle,
};

const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_VIDEO_DURATION: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcAnswer {
    pub session_id: String,
    pub sdp: String,
}

pub struct WebRtcOutput {
    stun_servers: Vec<String>,
}

impl WebRtcOutput {
    #[must_use]
    pub const fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?;
        Ok(Arc::new(pc))
    }
}

fn capability(mime_type: &str, clock_rate: u32, channels: u16, fmtp: &str) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        clock_rate,
        channels,
        sdp_fmtp_line: fmtp.to_owned(),
        rtcp_feedback: Vec::new(),
    }
}

/// The local track for each stream track WebRTC can carry without
/// transcoding: H.264 video and G.711 audio.
fn local_tracks(tracks: &[TrackInfo], stream_id: &str) -> Vec<(TrackInfo, Arc<TrackLocalStaticSample>)> {
    tracks
        .iter()
        .filter_map(|info| {
            let codec = match info.codec {
                CodecTag::H264 => capability(
                    MIME_TYPE_H264,
                    90_000,
                    0,
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
                ),
                CodecTag::G711A => capability(MIME_TYPE_PCMA, 8000, 0, ""),
                CodecTag::G711U => capability(MIME_TYPE_PCMU, 8000, 0, ""),
                _ => return None,
            };
            let track = TrackLocalStaticSample::new(codec, format!("track{}", info.id), stream_id.to_owned());
            Some((info.clone(), Arc::new(track)))
        })
        .collect()
}

/// Keyframes go out with in-band parameter sets so a browser can start
/// decoding from any of them.
fn with_parameter_sets(frame: &Frame, config: Option<&Bytes>) -> Bytes {
    let Some(config) = config.filter(|_| frame.keyframe) else {
        return frame.payload.clone();
    };
    if h264::extract_parameter_sets(&frame.payload).0.is_some() {
        return frame.payload.clone();
    }
    let mut out = BytesMut::with_capacity(config.len() + frame.payload.len());
    out.extend_from_slice(config);
    out.extend_from_slice(&frame.payload);
    out.freeze()
}

struct SampleWriter {
    tracks: Vec<(TrackInfo, Arc<TrackLocalStaticSample>)>,
    last_video_dts: Option<i64>,
    written: u64,
}

impl SampleWriter {
    async fn write(&mut self, frame: &Frame) -> Result<()> {
        let Some((info, track)) = self.tracks.iter().find(|(t, _)| t.codec == frame.codec) else {
            return Ok(());
        };
        let (data, duration) = if frame.is_video() {
            let duration = self
                .last_video_dts
                .map(|last| frame.dts_ms - last)
                .filter(|delta| *delta > 0)
                .map_or(DEFAULT_VIDEO_DURATION, |delta| Duration::from_millis(delta.unsigned_abs()));
            self.last_video_dts = Some(frame.dts_ms);
            (with_parameter_sets(frame, info.config.as_ref()), duration)
        } else {
            // one byte per sample at 8 kHz
            let samples = frame.payload.len() as u64;
            (frame.payload.clone(), Duration::from_micros(samples * 125))
        };
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        self.written += 1;
        Ok(())
    }
}

#[async_trait]
impl OutputAdapter for WebRtcOutput {
    fn protocol(&self) -> Protocol {
        Protocol::WebRtc
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        let offer = options
            .offer_sdp
            .clone()
            .ok_or_else(|| GatewayError::InvalidInput("WebRTC play needs an SDP offer".into()))?;
        let offer = RTCSessionDescription::offer(offer).map_err(|e| GatewayError::InvalidInput(e.to_string()))?;

        let tracks = local_tracks(&stream.tracks(), &stream.key().to_string());
        if tracks.is_empty() {
            return Err(GatewayError::Unsupported(format!(
                "{} has no track WebRTC can carry",
                stream.key()
            )));
        }

        let pc = self.peer_connection().await?;
        for (_, track) in &tracks {
            let sender = pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP has to be read for the interceptors to run
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let session_id = nanoid::nanoid!();
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            let session_id = session_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(session = %session_id, %state, "WebRTC peer state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected
                ) {
                    cancel.cancel();
                }
                Box::pin(async {})
            }));
        }

        let negotiated = async {
            pc.set_remote_description(offer).await?;
            let answer = pc.create_answer(None).await?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(answer).await?;
            if tokio::time::timeout(ICE_GATHERING_TIMEOUT, gathered.recv()).await.is_err() {
                warn!("ICE gathering timed out, answering with the candidates found so far");
            }
            pc.local_description()
                .await
                .ok_or_else(|| GatewayError::Internal("no local description after answer".into()))
        }
        .await;
        let local = match negotiated {
            Ok(local) => local,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let consumer = match FrameConsumer::attach(stream, Protocol::WebRtc, &options) {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };
        let span = tracing::info_span!("webrtc", stream = %stream.key(), session = %session_id);
        tokio::spawn(
            run(
                consumer,
                pc,
                SampleWriter {
                    tracks,
                    last_video_dts: None,
                    written: 0,
                },
                cancel,
            )
            .instrument(span),
        );

        Ok(OutputSession::WebRtc(WebRtcAnswer {
            session_id,
            sdp: local.sdp,
        }))
    }
}

async fn run(mut consumer: FrameConsumer, pc: Arc<RTCPeerConnection>, mut writer: SampleWriter, cancel: CancellationToken) {
    info!(consumer = consumer.id(), "WebRTC session started");
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = consumer.recv() => next,
        };
        match next {
            Ok(Some(frame)) => {
                if let Err(e) = writer.write(&frame).await {
                    warn!(error = %e, "Writing sample failed, closing session");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "WebRTC consumer ended");
                break;
            }
        }
    }
    if let Err(e) = pc.close().await {
        debug!(error = %e, "Closing peer connection");
    }
    info!(samples = writer.written, resyncs = consumer.resyncs(), "WebRTC session finished");
    consumer.detach();
}
