//! Protocol-neutral media envelope shared by every adapter.

use std::{fmt, str::FromStr, sync::LazyLock};

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("Invalid stream name regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecTag {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
    Opus,
}

impl CodecTag {
    #[must_use]
    pub const fn kind(self) -> TrackKind {
        match self {
            Self::H264 | Self::H265 => TrackKind::Video,
            Self::Aac | Self::G711A | Self::G711U | Self::Opus => TrackKind::Audio,
        }
    }

    /// MPEG-TS / PS stream type, where one exists.
    #[must_use]
    pub const fn stream_type(self) -> Option<u8> {
        use mediagate_media::mpegts::define::stream_type;
        match self {
            Self::H264 => Some(stream_type::H264),
            Self::H265 => Some(stream_type::H265),
            Self::Aac => Some(stream_type::AAC),
            Self::G711A => Some(stream_type::G711A),
            Self::G711U => Some(stream_type::G711U),
            Self::Opus => None,
        }
    }

    #[must_use]
    pub const fn from_stream_type(stream_type: u8) -> Option<Self> {
        use mediagate_media::mpegts::define::stream_type as st;
        match stream_type {
            st::H264 => Some(Self::H264),
            st::H265 => Some(Self::H265),
            st::AAC => Some(Self::Aac),
            st::G711A => Some(Self::G711A),
            st::G711U => Some(Self::G711U),
            _ => None,
        }
    }
}

/// Closed set of wire protocols the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Rtsp,
    Rtmp,
    Rtp,
    Gb28181,
    Flv,
    Hls,
    HlsFmp4,
    HttpTs,
    HttpFmp4,
    WebRtc,
    Record,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp",
            Self::Rtmp => "rtmp",
            Self::Rtp => "rtp",
            Self::Gb28181 => "gb28181",
            Self::Flv => "flv",
            Self::Hls => "hls",
            Self::HlsFmp4 => "hls_fmp4",
            Self::HttpTs => "http_ts",
            Self::HttpFmp4 => "http_fmp4",
            Self::WebRtc => "webrtc",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `app/stream`, the identity of a stream everywhere in the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub app: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(app: impl Into<String>, stream: impl Into<String>) -> Result<Self, GatewayError> {
        let key = Self {
            app: app.into(),
            stream: stream.into(),
        };
        for part in [&key.app, &key.stream] {
            if !NAME_PATTERN.is_match(part) || part == "." || part == ".." {
                return Err(GatewayError::InvalidInput(format!(
                    "invalid stream key component: {part:?}"
                )));
            }
        }
        Ok(key)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.stream)
    }
}

impl FromStr for StreamKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (app, stream) = s
            .split_once('/')
            .ok_or_else(|| GatewayError::InvalidInput(format!("stream key must be app/stream: {s:?}")))?;
        Self::new(app, stream)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub id: u32,
    pub kind: TrackKind,
    pub codec: CodecTag,
    pub clock_rate: u32,
    /// Annex-B SPS/PPS for video, AudioSpecificConfig for AAC.
    #[serde(skip)]
    pub config: Option<Bytes>,
}

impl TrackInfo {
    pub const VIDEO_ID: u32 = 0;
    pub const AUDIO_ID: u32 = 1;

    #[must_use]
    pub fn video(codec: CodecTag, config: Option<Bytes>) -> Self {
        Self {
            id: Self::VIDEO_ID,
            kind: TrackKind::Video,
            codec,
            clock_rate: 90_000,
            config,
        }
    }

    #[must_use]
    pub fn audio(codec: CodecTag, clock_rate: u32, config: Option<Bytes>) -> Self {
        Self {
            id: Self::AUDIO_ID,
            kind: TrackKind::Audio,
            codec,
            clock_rate,
            config,
        }
    }
}

/// One immutable media unit. Cloning is cheap: the payload is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Assigned by the frame bus at publish time, monotonic per stream.
    pub seq: u64,
    pub track: u32,
    pub kind: TrackKind,
    pub codec: CodecTag,
    pub pts_ms: i64,
    pub dts_ms: i64,
    /// Always true for audio.
    pub keyframe: bool,
    /// Annex-B access unit for video, raw access unit for audio.
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn video(codec: CodecTag, pts_ms: i64, dts_ms: i64, keyframe: bool, payload: Bytes) -> Self {
        Self {
            seq: 0,
            track: TrackInfo::VIDEO_ID,
            kind: TrackKind::Video,
            codec,
            pts_ms,
            dts_ms,
            keyframe,
            payload,
        }
    }

    #[must_use]
    pub fn audio(codec: CodecTag, pts_ms: i64, payload: Bytes) -> Self {
        Self {
            seq: 0,
            track: TrackInfo::AUDIO_ID,
            kind: TrackKind::Audio,
            codec,
            pts_ms,
            dts_ms: pts_ms,
            keyframe: true,
            payload,
        }
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_validation() {
        let key: StreamKey = "live/cam-1.main".parse().unwrap();
        assert_eq!(key.to_string(), "live/cam-1.main");
        assert!(StreamKey::new("live", "a b").is_err());
        assert!(StreamKey::new("..", "x").is_err());
        assert!(StreamKey::new("", "x").is_err());
        assert!("nokey".parse::<StreamKey>().is_err());
        assert!("a/b/c".parse::<StreamKey>().is_err());
    }

    #[test]
    fn test_audio_is_keyframe() {
        let frame = Frame::audio(CodecTag::Aac, 40, Bytes::from_static(&[1]));
        assert!(frame.keyframe);
        assert_eq!(frame.dts_ms, 40);
        assert_eq!(CodecTag::Aac.kind(), TrackKind::Audio);
        assert_eq!(CodecTag::from_stream_type(0x1B), Some(CodecTag::H264));
    }
}
