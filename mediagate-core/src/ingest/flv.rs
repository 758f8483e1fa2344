//! FLV tag bodies (RTMP messages, HTTP-FLV tags) to frames.

use bytes::{Bytes, BytesMut};
use mediagate_media::{
    aac::AudioSpecificConfig,
    flv::demuxer::{AudioTag, FlvAudioTagDemuxer, FlvVideoTagDemuxer, VideoTag},
};

use crate::{
    error::{GatewayError, Result},
    frame::{CodecTag, Frame, TrackInfo},
};

pub struct FlvAssembler {
    video: FlvVideoTagDemuxer,
    audio: FlvAudioTagDemuxer,
    video_track: Option<TrackInfo>,
    audio_track: Option<TrackInfo>,
    enable_audio: bool,
    dirty: bool,
}

impl FlvAssembler {
    #[must_use]
    pub const fn new(enable_audio: bool) -> Self {
        Self {
            video: FlvVideoTagDemuxer::new(),
            audio: FlvAudioTagDemuxer::new(),
            video_track: None,
            audio_track: None,
            enable_audio,
            dirty: false,
        }
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.video_track
            .iter()
            .chain(self.audio_track.iter())
            .cloned()
            .collect()
    }

    pub fn take_update(&mut self) -> Option<Vec<TrackInfo>> {
        std::mem::take(&mut self.dirty).then(|| self.tracks())
    }

    fn set_track(&mut self, track: TrackInfo) {
        let slot = if track.id == TrackInfo::VIDEO_ID {
            &mut self.video_track
        } else {
            &mut self.audio_track
        };
        if slot.as_ref() != Some(&track) {
            *slot = Some(track);
            self.dirty = true;
        }
    }

    /// One video tag body; sequence headers update the track and yield
    /// nothing.
    pub fn video(&mut self, timestamp: u32, body: &[u8]) -> Result<Option<Frame>> {
        match self.video.demux(timestamp, BytesMut::from(body))? {
            VideoTag::Config(record) => {
                let config = record.parameter_sets_annexb().freeze();
                self.set_track(TrackInfo::video(CodecTag::H264, Some(config)));
                Ok(None)
            }
            VideoTag::Frame {
                dts,
                pts,
                keyframe,
                data,
            } => Ok(Some(Frame::video(
                CodecTag::H264,
                i64::from(pts),
                i64::from(dts),
                keyframe,
                data,
            ))),
            VideoTag::EndOfSequence => Ok(None),
        }
    }

    pub fn audio(&mut self, timestamp: u32, body: &[u8]) -> Result<Option<Frame>> {
        if !self.enable_audio {
            return Ok(None);
        }
        match self.audio.demux(timestamp, BytesMut::from(body))? {
            AudioTag::AacConfig(asc) => {
                let config = AudioSpecificConfig::parse(&asc)
                    .ok_or_else(|| GatewayError::Protocol("invalid AudioSpecificConfig".to_string()))?;
                self.set_track(TrackInfo::audio(CodecTag::Aac, config.sample_rate(), Some(asc)));
                Ok(None)
            }
            AudioTag::Aac { timestamp, data } => {
                if self.audio_track.is_none() {
                    return Err(GatewayError::Protocol("AAC frame before sequence header".to_string()));
                }
                Ok(Some(Frame::audio(CodecTag::Aac, i64::from(timestamp), data)))
            }
            AudioTag::G711 { alaw, timestamp, data } => {
                let codec = if alaw { CodecTag::G711A } else { CodecTag::G711U };
                self.set_track(TrackInfo::audio(codec, 8000, None));
                Ok(Some(Frame::audio(codec, i64::from(timestamp), data)))
            }
        }
    }
}

/// The pieces a player needs before the first frame: AVC and AAC sequence
/// header bodies for the given tracks.
#[must_use]
pub fn sequence_headers(tracks: &[TrackInfo]) -> (Option<Bytes>, Option<Bytes>) {
    use mediagate_media::{flv::muxer, h264::config::AvcDecoderConfigurationRecord};

    let video = tracks
        .iter()
        .find(|t| t.codec == CodecTag::H264)
        .and_then(|t| t.config.as_ref())
        .and_then(|config| AvcDecoderConfigurationRecord::from_annexb(config))
        .and_then(|record| muxer::avc_sequence_header_body(&record).ok())
        .map(BytesMut::freeze);
    let audio = tracks
        .iter()
        .find(|t| t.codec == CodecTag::Aac)
        .and_then(|t| t.config.as_ref())
        .map(|asc| muxer::aac_sequence_header_body(asc).freeze());
    (video, audio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediagate_media::{
        flv::muxer::{aac_raw_body, aac_sequence_header_body, avc_nalu_body, avc_sequence_header_body},
        h264::config::AvcDecoderConfigurationRecord,
    };

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1F, 0xAC];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

    #[test]
    fn test_sequence_header_then_frames() {
        let record =
            AvcDecoderConfigurationRecord::from_parameter_sets(Bytes::from_static(SPS), Bytes::from_static(PPS))
                .unwrap();
        let mut assembler = FlvAssembler::new(true);

        let header = avc_sequence_header_body(&record).unwrap();
        assert!(assembler.video(0, &header).unwrap().is_none());
        let tracks = assembler.take_update().unwrap();
        assert_eq!(tracks.len(), 1);
        assert!(assembler.take_update().is_none());

        let body = avc_nalu_body(true, 40, &[0, 0, 0, 1, 0x65, 0x88]);
        let frame = assembler.video(1000, &body).unwrap().unwrap();
        assert!(frame.keyframe);
        assert_eq!((frame.dts_ms, frame.pts_ms), (1000, 1040));
        // keyframes carry the parameter sets in-band
        assert!(frame.payload.windows(2).any(|w| w == [1, 0x67]));

        let raw = aac_raw_body(&[0x21, 0x10]);
        assert!(assembler.audio(1000, &raw).is_err());
        assembler.audio(0, &aac_sequence_header_body(&[0x12, 0x10])).unwrap();
        let audio = assembler.audio(1023, &raw).unwrap().unwrap();
        assert_eq!(audio.pts_ms, 1023);
        assert_eq!(assembler.take_update().unwrap()[1].clock_rate, 44_100);

        let (video_header, audio_header) = sequence_headers(&assembler.tracks());
        assert!(video_header.is_some() && audio_header.is_some());
    }

    #[test]
    fn test_audio_disabled() {
        let mut assembler = FlvAssembler::new(false);
        assert!(assembler.audio(0, &aac_raw_body(&[1])).unwrap().is_none());
        assert!(assembler.tracks().is_empty());
    }
}
