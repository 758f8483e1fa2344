//! Raw RTP ingest and the RTP-to-frame demuxer shared with the RTSP client
//! and the GB28181 handoff.
//!
//! A [`RtpDemux`] owns one depacketizer per payload type. Timestamps are
//! unwrapped to 64 bits and rebased per payload type so every track starts
//! at zero.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mediagate_media::{
    h264::{extract_parameter_sets, to_annexb},
    ps::PsDemuxer,
    rtp::{aac, h264::H264Depacketizer, RtpPacket, SequenceTracker, TimestampUnwrapper},
    rtsp::sdp::MediaDescription,
};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

use super::{FrameSource, IngestAdapter, RtpTransport, SourceConfig};
use crate::{
    error::{GatewayError, Result},
    frame::{CodecTag, Frame, Protocol, StreamKey, TrackInfo},
    util::ticks_to_ms,
};

const MAX_DATAGRAM: usize = 64 * 1024;

/// What a payload type carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "snake_case")]
pub enum PayloadFormat {
    H264,
    Aac {
        clock_rate: u32,
        /// Hex AudioSpecificConfig.
        #[serde(default)]
        config: Option<String>,
    },
    G711a,
    G711u,
    /// MPEG program stream, as sent by GB28181 devices.
    Ps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMapping {
    pub payload_type: u8,
    #[serde(flatten)]
    pub format: PayloadFormat,
}

impl PayloadMapping {
    #[must_use]
    pub const fn new(payload_type: u8, format: PayloadFormat) -> Self {
        Self { payload_type, format }
    }

    /// Parses `96:h264,97:aac/44100/1210,8:g711a,96:ps`.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| {
                let bad = || GatewayError::InvalidInput(format!("bad payload mapping: {item}"));
                let (pt, rest) = item.split_once(':').ok_or_else(bad)?;
                let payload_type: u8 = pt.parse().map_err(|_| bad())?;
                let mut parts = rest.split('/');
                let format = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                    Some("h264") => PayloadFormat::H264,
                    Some("aac") => PayloadFormat::Aac {
                        clock_rate: parts.next().and_then(|r| r.parse().ok()).ok_or_else(bad)?,
                        config: parts.next().map(str::to_string),
                    },
                    Some("g711a" | "pcma") => PayloadFormat::G711a,
                    Some("g711u" | "pcmu") => PayloadFormat::G711u,
                    Some("ps") => PayloadFormat::Ps,
                    _ => return Err(bad()),
                };
                Ok(Self::new(payload_type, format))
            })
            .collect()
    }
}

enum Depacketizer {
    H264(H264Depacketizer),
    Aac(SequenceTracker),
    G711(CodecTag, SequenceTracker),
    Ps {
        demuxer: PsDemuxer,
        unit: BytesMut,
        unit_ts: Option<u32>,
        expected: Option<CodecTag>,
    },
}

struct PayloadState {
    depacketizer: Depacketizer,
    clock_rate: u32,
    unwrapper: TimestampUnwrapper,
    origin: Option<u64>,
}

impl PayloadState {
    fn ms(&mut self, ts: u32) -> i64 {
        let ticks = self.unwrapper.unwrap_ts(ts);
        let origin = *self.origin.get_or_insert(ticks);
        ticks_to_ms(ticks.saturating_sub(origin), self.clock_rate)
    }
}

#[derive(Default)]
struct TrackSet {
    video: Option<TrackInfo>,
    audio: Option<TrackInfo>,
    dirty: bool,
}

impl TrackSet {
    fn all(&self) -> Vec<TrackInfo> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }

    fn set(&mut self, track: TrackInfo) {
        let slot = if track.id == TrackInfo::VIDEO_ID {
            &mut self.video
        } else {
            &mut self.audio
        };
        if slot.as_ref() != Some(&track) {
            *slot = Some(track);
            self.dirty = true;
        }
    }

    fn learn_parameter_sets(&mut self, codec: CodecTag, annexb: &[u8]) {
        if let (Some(sps), Some(pps)) = extract_parameter_sets(annexb) {
            let config = to_annexb([&sps[..], &pps[..]]).freeze();
            if self.video.as_ref().and_then(|t| t.config.as_ref()) != Some(&config) {
                self.set(TrackInfo::video(codec, Some(config)));
            }
        }
    }
}

/// Turns RTP packets into frames.
#[derive(Default)]
pub struct RtpDemux {
    payloads: HashMap<u8, PayloadState>,
    tracks: TrackSet,
    ssrc: Option<u32>,
    enable_audio: bool,
}

fn decode_hex_config(config: Option<&str>) -> Result<Option<Bytes>> {
    config
        .map(|hex| {
            hex::decode(hex)
                .map(Bytes::from)
                .map_err(|e| GatewayError::InvalidInput(format!("bad AAC config {hex}: {e}")))
        })
        .transpose()
}

impl RtpDemux {
    #[must_use]
    pub fn new(enable_audio: bool) -> Self {
        Self {
            enable_audio,
            ..Self::default()
        }
    }

    /// Only packets from this SSRC are accepted.
    #[must_use]
    pub const fn with_ssrc(mut self, ssrc: Option<u32>) -> Self {
        self.ssrc = ssrc;
        self
    }

    pub fn from_mappings(mappings: &[PayloadMapping], enable_audio: bool) -> Result<Self> {
        let mut demux = Self::new(enable_audio);
        for mapping in mappings {
            demux.add(mapping)?;
        }
        Ok(demux)
    }

    pub fn add(&mut self, mapping: &PayloadMapping) -> Result<()> {
        let (depacketizer, clock_rate) = match &mapping.format {
            PayloadFormat::H264 => {
                self.tracks.set(TrackInfo::video(CodecTag::H264, None));
                (Depacketizer::H264(H264Depacketizer::new()), 90_000)
            }
            PayloadFormat::Aac { clock_rate, config } => {
                let config = decode_hex_config(config.as_deref())?;
                if self.enable_audio {
                    self.tracks.set(TrackInfo::audio(CodecTag::Aac, *clock_rate, config));
                }
                (Depacketizer::Aac(SequenceTracker::default()), *clock_rate)
            }
            PayloadFormat::G711a | PayloadFormat::G711u => {
                let codec = if mapping.format == PayloadFormat::G711a {
                    CodecTag::G711A
                } else {
                    CodecTag::G711U
                };
                if self.enable_audio {
                    self.tracks.set(TrackInfo::audio(codec, 8000, None));
                }
                (Depacketizer::G711(codec, SequenceTracker::default()), 8000)
            }
            PayloadFormat::Ps => (
                Depacketizer::Ps {
                    demuxer: PsDemuxer::new(),
                    unit: BytesMut::new(),
                    unit_ts: None,
                    expected: None,
                },
                90_000,
            ),
        };
        self.payloads.insert(
            mapping.payload_type,
            PayloadState {
                depacketizer,
                clock_rate,
                unwrapper: TimestampUnwrapper::default(),
                origin: None,
            },
        );
        Ok(())
    }

    /// Restricts a PS payload to one video codec; units carrying another
    /// codec are dropped as corrupt.
    pub fn expect_video_codec(&mut self, payload_type: u8, codec: CodecTag) {
        if let Some(PayloadState {
            depacketizer: Depacketizer::Ps { expected, .. },
            ..
        }) = self.payloads.get_mut(&payload_type)
        {
            *expected = Some(codec);
        }
    }

    /// Maps one SDP media section. Returns false for codecs the gateway
    /// does not relay.
    pub fn add_media(&mut self, media: &MediaDescription) -> Result<bool> {
        let format = match media.encoding.as_str() {
            "H264" => PayloadFormat::H264,
            "MPEG4-GENERIC" => PayloadFormat::Aac {
                clock_rate: media.clock_rate,
                config: media.aac_config().map(hex::encode),
            },
            "PCMA" => PayloadFormat::G711a,
            "PCMU" => PayloadFormat::G711u,
            "MP2P" => PayloadFormat::Ps,
            _ => return Ok(false),
        };
        self.add(&PayloadMapping::new(media.payload_type, format.clone()))?;
        if format == PayloadFormat::H264 {
            if let (Some(sps), Some(pps)) = media.h264_parameter_sets() {
                self.tracks.set(TrackInfo::video(
                    CodecTag::H264,
                    Some(to_annexb([&sps[..], &pps[..]]).freeze()),
                ));
                if let Some(PayloadState {
                    depacketizer: Depacketizer::H264(depacketizer),
                    ..
                }) = self.payloads.get_mut(&media.payload_type)
                {
                    depacketizer.set_parameter_sets(sps, pps);
                }
            }
        }
        Ok(true)
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.tracks.all()
    }

    pub fn take_update(&mut self) -> Option<Vec<TrackInfo>> {
        std::mem::take(&mut self.tracks.dirty).then(|| self.tracks.all())
    }

    /// Feeds one packet; finished frames are appended to `out`. An error
    /// means a unit was dropped, frames already in `out` are still good.
    pub fn push(&mut self, packet: &RtpPacket, out: &mut Vec<Frame>) -> Result<()> {
        if self.ssrc.is_some_and(|ssrc| ssrc != packet.header.ssrc) {
            return Ok(());
        }
        let pt = packet.header.payload_type;
        let state = self
            .payloads
            .get_mut(&pt)
            .ok_or_else(|| GatewayError::Protocol(format!("unexpected payload type {pt}")))?;

        match &mut state.depacketizer {
            Depacketizer::H264(depacketizer) => {
                let mut units = Vec::new();
                let result = depacketizer.push(packet, &mut units);
                for unit in units {
                    let ms = state.ms(unit.timestamp);
                    if unit.keyframe {
                        self.tracks.learn_parameter_sets(CodecTag::H264, &unit.data);
                    }
                    out.push(Frame::video(CodecTag::H264, ms, ms, unit.keyframe, unit.data));
                }
                result?;
            }
            Depacketizer::Aac(sequence) => {
                if !sequence.accept(packet.header.sequence_number) || !self.enable_audio {
                    return Ok(());
                }
                for (ts, unit) in aac::depacketize(packet)? {
                    let ms = state.ms(ts);
                    out.push(Frame::audio(CodecTag::Aac, ms, unit));
                }
            }
            Depacketizer::G711(codec, sequence) => {
                if !sequence.accept(packet.header.sequence_number) || !self.enable_audio {
                    return Ok(());
                }
                let codec = *codec;
                let ms = state.ms(packet.header.timestamp);
                out.push(Frame::audio(codec, ms, packet.payload.clone()));
            }
            Depacketizer::Ps {
                demuxer,
                unit,
                unit_ts,
                expected,
            } => {
                // a PS unit spans every packet with the same timestamp
                let mut finished = None;
                if unit_ts.is_some_and(|ts| ts != packet.header.timestamp) && !unit.is_empty() {
                    finished = Some(unit.split().freeze());
                }
                *unit_ts = Some(packet.header.timestamp);
                unit.extend_from_slice(&packet.payload);
                if packet.header.marker && finished.is_none() {
                    finished = Some(unit.split().freeze());
                }
                let Some(ps) = finished else {
                    return Ok(());
                };
                let expected = *expected;
                let es_frames = demuxer.demux(&ps)?;
                let mut rejected = None;
                for es in es_frames {
                    let Some(codec) = CodecTag::from_stream_type(es.stream_type) else {
                        rejected = Some(format!("unknown PS stream type {:#04x}", es.stream_type));
                        continue;
                    };
                    if es.video {
                        if expected.is_some_and(|want| want != codec) {
                            rejected = Some(format!("expected {expected:?}, got {codec:?}"));
                            continue;
                        }
                        let origin = *state.origin.get_or_insert(es.dts);
                        let dts = ticks_to_ms(es.dts.saturating_sub(origin), 90_000);
                        let pts = ticks_to_ms(es.pts.saturating_sub(origin), 90_000);
                        if es.keyframe && codec == CodecTag::H264 {
                            self.tracks.learn_parameter_sets(codec, &es.data);
                        } else if self.tracks.video.as_ref().map(|t| t.codec) != Some(codec) {
                            self.tracks.set(TrackInfo::video(codec, None));
                        }
                        out.push(Frame::video(codec, pts, dts, es.keyframe, es.data));
                    } else if self.enable_audio {
                        let origin = *state.origin.get_or_insert(es.pts);
                        let pts = ticks_to_ms(es.pts.saturating_sub(origin), 90_000);
                        if self.tracks.audio.as_ref().map(|t| t.codec) != Some(codec) {
                            let (rate, config) = if codec == CodecTag::Aac {
                                adts_config(&es.data)
                            } else {
                                (8000, None)
                            };
                            self.tracks.set(TrackInfo::audio(codec, rate, config));
                        }
                        let payload = if codec == CodecTag::Aac {
                            strip_adts(es.data)
                        } else {
                            es.data
                        };
                        out.push(Frame::audio(codec, pts, payload));
                    }
                }
                if let Some(reason) = rejected {
                    return Err(GatewayError::Protocol(reason));
                }
            }
        }
        Ok(())
    }
}

/// AAC in PS is ADTS framed.
fn adts_config(data: &[u8]) -> (u32, Option<Bytes>) {
    mediagate_media::aac::split_adts(data)
        .first()
        .map_or((44_100, None), |(config, _)| (config.sample_rate(), Some(config.to_bytes())))
}

fn strip_adts(data: Bytes) -> Bytes {
    let units = mediagate_media::aac::split_adts(&data);
    match units.as_slice() {
        [] => data,
        [(_, unit)] => unit.clone(),
        many => {
            let mut joined = BytesMut::new();
            for (_, unit) in many {
                joined.extend_from_slice(unit);
            }
            joined.freeze()
        }
    }
}

/// Socket side of an RTP receiver.
pub enum RtpReceiver {
    Udp(UdpSocket),
    /// RFC 4571: one passive TCP peer, packets prefixed with a 16-bit length.
    Tcp {
        listener: TcpListener,
        conn: Option<Framed<TcpStream, LengthDelimitedCodec>>,
    },
}

fn rfc4571_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(usize::from(u16::MAX))
        .new_codec()
}

impl RtpReceiver {
    /// Binds `port`, or the first free port of `range` when `port` is 0.
    pub async fn bind(transport: RtpTransport, ip: IpAddr, port: u16, range: [u16; 2]) -> Result<Self> {
        if port != 0 {
            return Self::bind_exact(transport, ip, port).await;
        }
        let [low, high] = range;
        let span = u32::from(high.saturating_sub(low)) + 1;
        let start = rand::rng().random_range(0..span);
        let mut last_error = None;
        for i in 0..span {
            let candidate = low + ((start + i) % span) as u16;
            match Self::bind_exact(transport, ip, candidate).await {
                Ok(receiver) => return Ok(receiver),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| GatewayError::Busy("no free rtp port".to_string())))
    }

    async fn bind_exact(transport: RtpTransport, ip: IpAddr, port: u16) -> Result<Self> {
        let bind_err = |e: std::io::Error| GatewayError::Transport(format!("bind {ip}:{port}: {e}"));
        match transport {
            RtpTransport::Tcp => {
                let listener = TcpListener::bind(SocketAddr::new(ip, port)).await.map_err(bind_err)?;
                Ok(Self::Tcp { listener, conn: None })
            }
            RtpTransport::Udp => {
                let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await.map_err(bind_err)?;
                Ok(Self::Udp(socket))
            }
            RtpTransport::Multicast => {
                let IpAddr::V4(group) = ip else {
                    return Err(GatewayError::Unsupported("ipv6 multicast".to_string()));
                };
                let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
                    .await
                    .map_err(bind_err)?;
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| GatewayError::Transport(format!("join {group}: {e}")))?;
                Ok(Self::Udp(socket))
            }
        }
    }

    pub fn local_port(&self) -> Result<u16> {
        let addr = match self {
            Self::Udp(socket) => socket.local_addr(),
            Self::Tcp { listener, .. } => listener.local_addr(),
        };
        addr.map(|a| a.port()).map_err(GatewayError::transport)
    }

    /// Next datagram. `Ok(None)` when a TCP peer hung up.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self {
            Self::Udp(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let (n, _) = socket.recv_from(&mut buf).await.map_err(GatewayError::transport)?;
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            Self::Tcp { listener, conn } => {
                if conn.is_none() {
                    let (stream, peer) = listener.accept().await.map_err(GatewayError::transport)?;
                    debug!(%peer, "RTP over TCP peer connected");
                    *conn = Some(Framed::new(stream, rfc4571_codec()));
                }
                let Some(framed) = conn.as_mut() else {
                    return Ok(None);
                };
                match framed.next().await {
                    Some(Ok(packet)) => Ok(Some(packet.freeze())),
                    Some(Err(e)) => Err(GatewayError::transport(e)),
                    None => {
                        *conn = None;
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Frames from a bound RTP receiver.
pub struct RtpSource {
    receiver: RtpReceiver,
    demux: RtpDemux,
    pending: VecDeque<Frame>,
}

impl RtpSource {
    #[must_use]
    pub fn new(receiver: RtpReceiver, demux: RtpDemux) -> Self {
        Self {
            receiver,
            demux,
            pending: VecDeque::new(),
        }
    }

    pub fn local_port(&self) -> Result<u16> {
        self.receiver.local_port()
    }
}

#[async_trait]
impl FrameSource for RtpSource {
    fn tracks(&self) -> Vec<TrackInfo> {
        self.demux.tracks()
    }

    fn take_track_update(&mut self) -> Option<Vec<TrackInfo>> {
        self.demux.take_update()
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let Some(datagram) = self.receiver.recv().await? else {
                return Ok(None);
            };
            let packet = RtpPacket::parse(datagram)?;
            let mut out = Vec::new();
            let result = self.demux.push(&packet, &mut out);
            self.pending.extend(out);
            result?;
        }
    }
}

fn default_payloads() -> Vec<PayloadMapping> {
    vec![PayloadMapping::new(96, PayloadFormat::H264)]
}

const fn default_true() -> bool {
    true
}

/// Passive RTP receive port requested through the API, the non-GB28181
/// counterpart of [`super::gb28181::Gb28181Binding`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpBinding {
    /// `app/stream`
    pub stream_key: String,
    #[serde(default)]
    pub transport: RtpTransport,
    /// 0 allocates from `ingest.rtp_port_range`.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub ssrc: Option<u32>,
    #[serde(default = "default_payloads")]
    pub payloads: Vec<PayloadMapping>,
    #[serde(default = "default_true")]
    pub enable_audio: bool,
}

impl RtpBinding {
    pub fn key(&self) -> Result<StreamKey> {
        self.stream_key.parse()
    }

    pub async fn bind(&self, ip: IpAddr, port_range: [u16; 2]) -> Result<RtpSource> {
        if self.payloads.is_empty() {
            return Err(GatewayError::InvalidInput("no payload mapping".to_string()));
        }
        let demux = RtpDemux::from_mappings(&self.payloads, self.enable_audio)?.with_ssrc(self.ssrc);
        let receiver = RtpReceiver::bind(self.transport, ip, self.port, port_range).await?;
        Ok(RtpSource::new(receiver, demux))
    }
}

/// Receives `rtp://ip:port?payload=96:h264,97:aac/44100/1210&ssrc=1234`.
/// The source's transport picks UDP, RFC 4571 TCP, or multicast (the host
/// is then the group).
pub struct RtpIngest;

impl RtpIngest {
    pub fn parse(config: &SourceConfig) -> Result<(IpAddr, u16, RtpDemux)> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| GatewayError::InvalidInput(format!("bad rtp url {}: {e}", config.url)))?;
        let ip: IpAddr = url
            .host_str()
            .unwrap_or("0.0.0.0")
            .trim_matches(['[', ']'])
            .parse()
            .map_err(|_| GatewayError::InvalidInput(format!("rtp url needs an ip host: {}", config.url)))?;
        let port = url
            .port()
            .ok_or_else(|| GatewayError::InvalidInput(format!("rtp url needs a port: {}", config.url)))?;

        let mut payloads = vec![PayloadMapping::new(96, PayloadFormat::H264)];
        let mut ssrc = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "payload" => payloads = PayloadMapping::parse_list(&value)?,
                "ssrc" => {
                    ssrc = Some(
                        value
                            .parse()
                            .map_err(|_| GatewayError::InvalidInput(format!("bad ssrc {value}")))?,
                    );
                }
                _ => {}
            }
        }
        let demux = RtpDemux::from_mappings(&payloads, config.enable_audio)?.with_ssrc(ssrc);
        Ok((ip, port, demux))
    }
}

#[async_trait]
impl IngestAdapter for RtpIngest {
    fn protocol(&self) -> Protocol {
        Protocol::Rtp
    }

    async fn connect(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
        let (ip, port, demux) = Self::parse(config)?;
        let receiver = RtpReceiver::bind(config.transport, ip, port, [port, port]).await?;
        info!(%ip, port, transport = ?config.transport, "RTP receiver bound");
        Ok(Box::new(RtpSource::new(receiver, demux)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use mediagate_media::rtp::{aac::AacPacketizer, h264::H264Packetizer};

    const IDR: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0x1F, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88, 0x84];

    #[test]
    fn test_parse_payload_list() {
        let list = PayloadMapping::parse_list("96:h264, 97:aac/44100/1210,8:pcma").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(
            list[1].format,
            PayloadFormat::Aac {
                clock_rate: 44_100,
                config: Some("1210".to_string())
            }
        );
        assert!(PayloadMapping::parse_list("x:h264").is_err());
        assert!(PayloadMapping::parse_list("96:vp8").is_err());

        let json: PayloadMapping = serde_json::from_str(r#"{"payload_type": 96, "codec": "ps"}"#).unwrap();
        assert_eq!(json.format, PayloadFormat::Ps);
    }

    #[test]
    fn test_h264_and_aac_rebased_per_track() {
        let mappings = PayloadMapping::parse_list("96:h264,97:aac/48000/1190").unwrap();
        let mut demux = RtpDemux::from_mappings(&mappings, true).unwrap();
        let mut video = H264Packetizer::new(1200, 96, 1);
        let mut audio = AacPacketizer::new(97, 2);

        let mut out = Vec::new();
        for packet in video.packetize(IDR, 900_000) {
            demux.push(&packet, &mut out).unwrap();
        }
        for packet in video.packetize(&[0, 0, 0, 1, 0x41, 0x9A], 900_000 + 3600) {
            demux.push(&packet, &mut out).unwrap();
        }
        demux.push(&audio.packetize(&[0x21, 0x00], 5_000), &mut out).unwrap();
        demux.push(&audio.packetize(&[0x21, 0x01], 5_000 + 1024), &mut out).unwrap();

        let video: Vec<_> = out.iter().filter(|f| f.is_video()).collect();
        assert_eq!(video.len(), 2);
        assert!(video[0].keyframe);
        assert_eq!((video[0].pts_ms, video[1].pts_ms), (0, 40));
        let audio: Vec<_> = out.iter().filter(|f| !f.is_video()).collect();
        assert_eq!((audio[0].pts_ms, audio[1].pts_ms), (0, 21));

        let tracks = demux.take_update().unwrap();
        assert!(tracks[0].config.is_some(), "in-band sps/pps learned");
        assert_eq!(tracks[1].clock_rate, 48_000);
    }

    #[test]
    fn test_unknown_payload_type_and_ssrc_filter() {
        let mut demux = RtpDemux::from_mappings(&[PayloadMapping::new(96, PayloadFormat::H264)], true)
            .unwrap()
            .with_ssrc(Some(7));
        let mut packetizer = H264Packetizer::new(1200, 96, 8);
        let mut out = Vec::new();
        for packet in packetizer.packetize(IDR, 0) {
            demux.push(&packet, &mut out).unwrap();
        }
        assert!(out.is_empty(), "foreign ssrc ignored");

        let mut other = H264Packetizer::new(1200, 100, 7);
        let packet = other.packetize(IDR, 0).remove(0);
        assert!(matches!(demux.push(&packet, &mut out), Err(GatewayError::Protocol(_))));
    }

    #[test]
    fn test_parse_rtp_url() {
        let config = SourceConfig::new("rtp://127.0.0.1:30002?payload=96:ps&ssrc=42");
        let (ip, port, demux) = RtpIngest::parse(&config).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(port, 30002);
        assert_eq!(demux.ssrc, Some(42));
        assert!(RtpIngest::parse(&SourceConfig::new("rtp://127.0.0.1")).is_err());
    }

    #[tokio::test]
    async fn test_binding_defaults_and_bind() {
        let binding: RtpBinding = serde_json::from_str(r#"{"stream_key": "live/cam9"}"#).unwrap();
        assert_eq!(binding.payloads, vec![PayloadMapping::new(96, PayloadFormat::H264)]);
        assert_eq!(binding.transport, RtpTransport::Tcp);
        assert_eq!(binding.key().unwrap().to_string(), "live/cam9");

        let udp = RtpBinding {
            transport: RtpTransport::Udp,
            ..binding
        };
        let source = udp.bind(IpAddr::V4(Ipv4Addr::LOCALHOST), [0, 0]).await.unwrap();
        assert_ne!(source.local_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tcp_receiver_rfc4571() {
        let receiver = RtpReceiver::bind(RtpTransport::Tcp, IpAddr::V4(Ipv4Addr::LOCALHOST), 0, [0, 0])
            .await
            .unwrap();
        let port = receiver.local_port().unwrap();
        let demux = RtpDemux::from_mappings(&[PayloadMapping::new(96, PayloadFormat::H264)], true).unwrap();
        let mut source = RtpSource::new(receiver, demux);

        let sender = tokio::spawn(async move {
            let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
            let mut framed = Framed::new(stream, rfc4571_codec());
            let mut packetizer = H264Packetizer::new(1200, 96, 1);
            for packet in packetizer.packetize(IDR, 0) {
                framed.send(packet.marshal().freeze()).await.unwrap();
            }
        });

        let frame = source.next_frame().await.unwrap().unwrap();
        assert!(frame.keyframe);
        sender.await.unwrap();
        assert!(source.next_frame().await.unwrap().is_none());
    }
}
