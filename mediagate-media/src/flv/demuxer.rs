use {
    super::{
        define::{
            aac_packet_type, avc_packet_type, codec_id, frame_type, sound_format, FLV_HEADER_SIZE,
            FLV_PREV_TAG_SIZE_LEN, FLV_TAG_HEADER_SIZE, MAX_FLV_TAG_SIZE,
        },
        errors::{DemuxerErrorValue, FlvDemuxerError},
    },
    crate::h264::{avcc_to_annexb, config::AvcDecoderConfigurationRecord},
    bytes::{Buf, Bytes, BytesMut},
};

/*
 ** Flv Struct **
 +-------------------------------------------------------------------------------+
 | FLV header(9 bytes) | FLV body                                                |
 +-------------------------------------------------------------------------------+
 |                     | PreviousTagSize0(4 bytes)| Tag1|PreviousTagSize1|Tag2|...
 +-------------------------------------------------------------------------------+

 *** Flv Tag ***
 +-----------------------------------------------------------------------------------------------+
 | Tag Type(1) | Data Size(3) | Timestamp(3, dts) | Timestamp Extended(1) | Stream ID(3) | Data  |
 +-----------------------------------------------------------------------------------------------+

 **** Video Data (codecID == 7) ****
 +------------------------------------------------------------------------------------+
 | FrameType(4 bits) | CodecID(4 bits) | AVCPacketType(1) | CompositionTime(3) | Data |
 +------------------------------------------------------------------------------------+

 **** Audio Data ****
 +-------------------------------------------------------------------------------------+
 | SoundFormat(4 bits) | SoundRate(2 bits) | SoundSize(1 bit) | SoundType(1 bit) | Data |
 +-------------------------------------------------------------------------------------+
*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub data: BytesMut,
}

/// Incremental tag parser for an FLV byte stream arriving in arbitrary
/// chunks (HTTP-FLV bodies, files).
#[derive(Default)]
pub struct FlvTagReader {
    buffer: BytesMut,
    header_parsed: bool,
}

impl FlvTagReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete tag, `Ok(None)` when more input is needed.
    pub fn next_tag(&mut self) -> Result<Option<FlvTag>, FlvDemuxerError> {
        if !self.header_parsed {
            if self.buffer.len() < FLV_HEADER_SIZE + FLV_PREV_TAG_SIZE_LEN {
                return Ok(None);
            }
            if &self.buffer[0..3] != b"FLV" {
                return Err(DemuxerErrorValue::BadSignature.into());
            }
            let header_size = u32::from_be_bytes([
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
                self.buffer[8],
            ]) as usize;
            let skip = header_size.max(FLV_HEADER_SIZE) + FLV_PREV_TAG_SIZE_LEN;
            if self.buffer.len() < skip {
                return Ok(None);
            }
            self.buffer.advance(skip);
            self.header_parsed = true;
        }

        if self.buffer.len() < FLV_TAG_HEADER_SIZE {
            return Ok(None);
        }
        let tag_type = self.buffer[0] & 0x1F;
        let data_size = (usize::from(self.buffer[1]) << 16)
            | (usize::from(self.buffer[2]) << 8)
            | usize::from(self.buffer[3]);
        if data_size > MAX_FLV_TAG_SIZE {
            return Err(DemuxerErrorValue::TagTooLarge(data_size).into());
        }
        let total = FLV_TAG_HEADER_SIZE + data_size + FLV_PREV_TAG_SIZE_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let timestamp = (u32::from(self.buffer[7]) << 24)
            | (u32::from(self.buffer[4]) << 16)
            | (u32::from(self.buffer[5]) << 8)
            | u32::from(self.buffer[6]);

        let mut tag = self.buffer.split_to(total);
        tag.advance(FLV_TAG_HEADER_SIZE);
        tag.truncate(data_size);
        Ok(Some(FlvTag {
            tag_type,
            timestamp,
            data: tag,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoTag {
    Config(AvcDecoderConfigurationRecord),
    Frame {
        dts: u32,
        pts: u32,
        keyframe: bool,
        /// Annex-B; keyframes are prefixed with SPS/PPS.
        data: Bytes,
    },
    EndOfSequence,
}

#[derive(Default)]
pub struct FlvVideoTagDemuxer {
    record: Option<AvcDecoderConfigurationRecord>,
}

impl FlvVideoTagDemuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self { record: None }
    }

    #[must_use]
    pub const fn record(&self) -> Option<&AvcDecoderConfigurationRecord> {
        self.record.as_ref()
    }

    pub fn demux(&mut self, timestamp: u32, data: BytesMut) -> Result<VideoTag, FlvDemuxerError> {
        if data.len() < 5 {
            return Err(crate::bytesio::bytes_errors::BytesReadError::not_enough(5, data.len()).into());
        }
        let kind = data[0] >> 4;
        let codec = data[0] & 0x0F;
        if codec != codec_id::AVC {
            return Err(DemuxerErrorValue::UnsupportedVideoCodec(codec).into());
        }
        let packet_type = data[1];
        // composition time is a signed 24-bit value
        let cts = ((i32::from(data[2]) << 24) | (i32::from(data[3]) << 16) | (i32::from(data[4]) << 8)) >> 8;

        match packet_type {
            avc_packet_type::AVC_SEQHDR => {
                let record = AvcDecoderConfigurationRecord::parse(BytesMut::from(&data[5..]))?;
                self.record = Some(record.clone());
                Ok(VideoTag::Config(record))
            }
            avc_packet_type::AVC_NALU => {
                let record = self
                    .record
                    .as_ref()
                    .ok_or(DemuxerErrorValue::MissingSequenceHeader)?;
                let keyframe = kind == frame_type::KEY_FRAME;
                let nalus = avcc_to_annexb(&data[5..], record.length_size())?;
                let data = if keyframe {
                    let mut out = record.parameter_sets_annexb();
                    out.extend_from_slice(&nalus);
                    out.freeze()
                } else {
                    nalus.freeze()
                };
                Ok(VideoTag::Frame {
                    dts: timestamp,
                    pts: timestamp.wrapping_add_signed(cts),
                    keyframe,
                    data,
                })
            }
            _ => Ok(VideoTag::EndOfSequence),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioTag {
    /// AudioSpecificConfig
    AacConfig(Bytes),
    Aac { timestamp: u32, data: Bytes },
    G711 { alaw: bool, timestamp: u32, data: Bytes },
}

#[derive(Default)]
pub struct FlvAudioTagDemuxer;

impl FlvAudioTagDemuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    pub fn demux(&mut self, timestamp: u32, mut data: BytesMut) -> Result<AudioTag, FlvDemuxerError> {
        if data.is_empty() {
            return Err(crate::bytesio::bytes_errors::BytesReadError::not_enough(1, 0).into());
        }
        let format = data[0] >> 4;
        match format {
            sound_format::AAC => {
                if data.len() < 2 {
                    return Err(crate::bytesio::bytes_errors::BytesReadError::not_enough(2, data.len()).into());
                }
                let packet_type = data[1];
                data.advance(2);
                if packet_type == aac_packet_type::AAC_SEQHDR {
                    Ok(AudioTag::AacConfig(data.freeze()))
                } else {
                    Ok(AudioTag::Aac {
                        timestamp,
                        data: data.freeze(),
                    })
                }
            }
            sound_format::G711A | sound_format::G711U => {
                data.advance(1);
                Ok(AudioTag::G711 {
                    alaw: format == sound_format::G711A,
                    timestamp,
                    data: data.freeze(),
                })
            }
            other => Err(DemuxerErrorValue::UnsupportedSoundFormat(other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::{
        define::tag_type,
        muxer::{aac_raw_body, aac_sequence_header_body, avc_nalu_body, avc_sequence_header_body, FlvMuxer},
    };

    fn record() -> AvcDecoderConfigurationRecord {
        AvcDecoderConfigurationRecord::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]),
            Bytes::from_static(&[0x68, 0xce]),
        )
        .unwrap()
    }

    #[test]
    fn test_tag_reader_handles_split_input() {
        let mut muxer = FlvMuxer::new();
        muxer.write_flv_header(false, true).unwrap();
        muxer.write_tag(tag_type::VIDEO, 40, &[1, 2, 3]).unwrap();
        muxer.write_tag(tag_type::AUDIO, 0x0100_0000, &[4]).unwrap();
        let stream = muxer.extract();

        let mut reader = FlvTagReader::new();
        let mut tags = Vec::new();
        for chunk in stream.chunks(5) {
            reader.extend(chunk);
            while let Some(tag) = reader.next_tag().unwrap() {
                tags.push(tag);
            }
        }
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].timestamp, 40);
        assert_eq!(&tags[0].data[..], &[1, 2, 3]);
        assert_eq!(tags[1].timestamp, 0x0100_0000);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_tag_reader_rejects_bad_signature() {
        let mut reader = FlvTagReader::new();
        reader.extend(b"XYZ\x01\x05\x00\x00\x00\x09\x00\x00\x00\x00");
        assert!(reader.next_tag().is_err());
    }

    #[test]
    fn test_video_demux_roundtrip() {
        let mut demuxer = FlvVideoTagDemuxer::new();
        let header = avc_sequence_header_body(&record()).unwrap();
        assert!(matches!(demuxer.demux(0, header).unwrap(), VideoTag::Config(_)));

        let body = avc_nalu_body(true, 80, &[0, 0, 0, 1, 0x65, 0x11]);
        match demuxer.demux(1000, body).unwrap() {
            VideoTag::Frame { dts, pts, keyframe, data } => {
                assert_eq!(dts, 1000);
                assert_eq!(pts, 1080);
                assert!(keyframe);
                assert_eq!(
                    &data[..],
                    &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x11]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_video_before_sequence_header() {
        let mut demuxer = FlvVideoTagDemuxer::new();
        let body = avc_nalu_body(false, 0, &[0, 0, 0, 1, 0x41, 0x11]);
        assert!(demuxer.demux(0, body).is_err());
    }

    #[test]
    fn test_negative_composition_time() {
        let mut demuxer = FlvVideoTagDemuxer::new();
        demuxer.demux(0, avc_sequence_header_body(&record()).unwrap()).unwrap();
        let body = avc_nalu_body(false, -40, &[0, 0, 0, 1, 0x41, 0x11]);
        match demuxer.demux(1000, body).unwrap() {
            VideoTag::Frame { pts, .. } => assert_eq!(pts, 960),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_audio_demux() {
        let mut demuxer = FlvAudioTagDemuxer::new();
        assert_eq!(
            demuxer.demux(0, aac_sequence_header_body(&[0x12, 0x10])).unwrap(),
            AudioTag::AacConfig(Bytes::from_static(&[0x12, 0x10]))
        );
        assert_eq!(
            demuxer.demux(23, aac_raw_body(&[9, 9])).unwrap(),
            AudioTag::Aac {
                timestamp: 23,
                data: Bytes::from_static(&[9, 9])
            }
        );
    }
}
