//! RTSP play: SDP description and RTP packetization per client session.

use async_trait::async_trait;
use bytes::Bytes;
use mediagate_media::{
    aac::AudioSpecificConfig,
    h264,
    rtp::{aac::AacPacketizer, h264::H264Packetizer, RtpHeader, RtpPacket},
    rtsp::sdp::SdpBuilder,
};
use rand::RngExt;

use super::{AttachOptions, FrameConsumer, OutputAdapter, OutputSession};
use crate::{
    error::{GatewayError, Result},
    frame::{CodecTag, Frame, Protocol, TrackInfo},
    registry::StreamHandle,
    util,
};

const RTP_MTU: usize = 1400;
const H264_PAYLOAD_TYPE: u8 = 96;
const AAC_PAYLOAD_TYPE: u8 = 97;

pub struct RtspOutput;

#[async_trait]
impl OutputAdapter for RtspOutput {
    fn protocol(&self) -> Protocol {
        Protocol::Rtsp
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        Ok(OutputSession::Frames(FrameConsumer::attach(stream, Protocol::Rtsp, &options)?))
    }
}

enum Packetizer {
    H264(H264Packetizer),
    Aac(AacPacketizer),
    G711 { payload_type: u8, ssrc: u32, sequence: u16 },
}

struct OutTrack {
    info: TrackInfo,
    control: String,
    /// RTP interleaved channel, once SETUP chose one.
    channel: Option<u8>,
    packetizer: Packetizer,
}

/// One RTSP client's view of a stream.
pub struct RtspPackager {
    tracks: Vec<OutTrack>,
    origin: Option<i64>,
}

impl RtspPackager {
    /// Tracks that RTP can carry here: H.264, AAC and G.711.
    #[must_use]
    pub fn new(tracks: &[TrackInfo]) -> Self {
        let mut rng = rand::rng();
        let mut out = Vec::new();
        for info in tracks {
            let ssrc: u32 = rng.random();
            let packetizer = match info.codec {
                CodecTag::H264 => Packetizer::H264(H264Packetizer::new(RTP_MTU, H264_PAYLOAD_TYPE, ssrc)),
                CodecTag::Aac if info.config.is_some() => Packetizer::Aac(AacPacketizer::new(AAC_PAYLOAD_TYPE, ssrc)),
                CodecTag::G711A | CodecTag::G711U => Packetizer::G711 {
                    payload_type: if info.codec == CodecTag::G711A { 8 } else { 0 },
                    ssrc,
                    sequence: rng.random(),
                },
                _ => continue,
            };
            out.push(OutTrack {
                info: info.clone(),
                control: format!("track{}", out.len()),
                channel: None,
                packetizer,
            });
        }
        Self {
            tracks: out,
            origin: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// DESCRIBE body; track controls are `track0`, `track1`, ...
    #[must_use]
    pub fn sdp(&self, session_name: &str, origin_ip: &str) -> String {
        let mut builder = SdpBuilder::new(session_name, origin_ip);
        for track in &self.tracks {
            builder = match &track.packetizer {
                Packetizer::H264(_) => {
                    let (sps, pps) = track
                        .info
                        .config
                        .as_deref()
                        .map(h264::extract_parameter_sets)
                        .unwrap_or_default();
                    builder.h264(H264_PAYLOAD_TYPE, sps.as_deref(), pps.as_deref())
                }
                Packetizer::Aac(_) => {
                    let config = track.info.config.clone().unwrap_or_default();
                    let channels = AudioSpecificConfig::parse(&config).map_or(2, |c| c.channel_configuration.max(1));
                    builder.aac(AAC_PAYLOAD_TYPE, track.info.clock_rate, channels, &config)
                }
                Packetizer::G711 { payload_type, .. } => builder.g711(*payload_type == 8),
            };
        }
        builder.build()
    }

    /// Binds the track whose control the SETUP url ends with to an
    /// interleaved channel pair starting at `rtp_channel`.
    pub fn setup(&mut self, url: &str, rtp_channel: u8) -> Result<&TrackInfo> {
        let track = self
            .tracks
            .iter_mut()
            .find(|t| url.trim_end_matches('/').ends_with(&t.control))
            .ok_or_else(|| GatewayError::NotFound(format!("no track for {url}")))?;
        track.channel = Some(rtp_channel);
        Ok(&track.info)
    }

    #[must_use]
    pub fn is_setup(&self) -> bool {
        self.tracks.iter().any(|t| t.channel.is_some())
    }

    /// `RTP-Info` for the PLAY response.
    #[must_use]
    pub fn rtp_info(&self, base_url: &str) -> String {
        self.tracks
            .iter()
            .filter(|t| t.channel.is_some())
            .map(|t| {
                let seq = match &t.packetizer {
                    Packetizer::H264(p) => p.next_sequence(),
                    Packetizer::Aac(_) => 0,
                    Packetizer::G711 { sequence, .. } => *sequence,
                };
                format!("url={}/{};seq={seq};rtptime=0", base_url.trim_end_matches('/'), t.control)
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Interleaved `(channel, rtp packet)` pairs for one frame. Frames of
    /// tracks the client did not set up produce nothing.
    pub fn packets(&mut self, frame: &Frame) -> Vec<(u8, Bytes)> {
        let origin = *self.origin.get_or_insert(frame.dts_ms);
        let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.info.kind == frame.kind && t.info.codec == frame.codec)
        else {
            return Vec::new();
        };
        let Some(channel) = track.channel else {
            return Vec::new();
        };
        let timestamp = util::ms_to_rtp(frame.pts_ms - origin, track.info.clock_rate);
        let packets = match &mut track.packetizer {
            Packetizer::H264(packetizer) => packetizer.packetize(&frame.payload, timestamp),
            Packetizer::Aac(packetizer) => vec![packetizer.packetize(&frame.payload, timestamp)],
            Packetizer::G711 {
                payload_type,
                ssrc,
                sequence,
            } => {
                let packet = RtpPacket {
                    header: RtpHeader {
                        marker: true,
                        payload_type: *payload_type,
                        sequence_number: *sequence,
                        timestamp,
                        ssrc: *ssrc,
                        csrcs: Vec::new(),
                    },
                    payload: frame.payload.clone(),
                };
                *sequence = sequence.wrapping_add(1);
                vec![packet]
            }
        };
        packets
            .into_iter()
            .map(|packet| (channel, packet.marshal().freeze()))
            .collect()
    }
}
