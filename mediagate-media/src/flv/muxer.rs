use {
    super::{
        define::{aac_packet_type, avc_packet_type, codec_id, frame_type, sound_format, FLV_TAG_HEADER_SIZE},
        errors::{FlvMuxerError, MuxerErrorValue},
    },
    crate::{
        bytesio::bytes_writer::BytesWriter,
        h264::{annexb_to_avcc, config::AvcDecoderConfigurationRecord},
    },
    byteorder::BigEndian,
    bytes::{BufMut, BytesMut},
};

/// Writes an FLV byte stream: file header followed by tags, each trailed by
/// its PreviousTagSize.
pub struct FlvMuxer {
    pub writer: BytesWriter,
}

impl Default for FlvMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: BytesWriter::new(),
        }
    }

    pub fn write_flv_header(&mut self, has_audio: bool, has_video: bool) -> Result<(), FlvMuxerError> {
        self.writer.write(b"FLV")?;
        self.writer.write_u8(0x01)?;
        let flags = (u8::from(has_audio) << 2) | u8::from(has_video);
        self.writer.write_u8(flags)?;
        self.writer.write_u32::<BigEndian>(9)?;
        // PreviousTagSize0
        self.writer.write_u32::<BigEndian>(0)?;
        Ok(())
    }

    pub fn write_tag(&mut self, tag_type: u8, timestamp: u32, body: &[u8]) -> Result<(), FlvMuxerError> {
        if body.len() > 0x00FF_FFFF {
            return Err(MuxerErrorValue::TagTooLarge(body.len()).into());
        }
        self.writer.write_u8(tag_type)?;
        self.writer.write_u24::<BigEndian>(body.len() as u32)?;
        self.writer.write_u24::<BigEndian>(timestamp & 0x00FF_FFFF)?;
        self.writer.write_u8((timestamp >> 24) as u8)?;
        // stream id
        self.writer.write_u24::<BigEndian>(0)?;
        self.writer.write(body)?;
        self.writer
            .write_u32::<BigEndian>((FLV_TAG_HEADER_SIZE + body.len()) as u32)?;
        Ok(())
    }

    pub fn extract(&mut self) -> BytesMut {
        self.writer.extract_current_bytes()
    }
}

pub fn avc_sequence_header_body(record: &AvcDecoderConfigurationRecord) -> Result<BytesMut, FlvMuxerError> {
    let config = record.write()?;
    let mut body = BytesMut::with_capacity(config.len() + 5);
    body.put_u8((frame_type::KEY_FRAME << 4) | codec_id::AVC);
    body.put_u8(avc_packet_type::AVC_SEQHDR);
    body.put_slice(&[0, 0, 0]);
    body.put_slice(&config);
    Ok(body)
}

/// Video tag body for one Annex-B access unit. Parameter sets are carried by
/// the sequence header, so in-band SPS/PPS are stripped.
#[must_use]
pub fn avc_nalu_body(keyframe: bool, composition_time_ms: i32, annexb: &[u8]) -> BytesMut {
    let avcc = annexb_to_avcc(annexb, false);
    let mut body = BytesMut::with_capacity(avcc.len() + 5);
    let kind = if keyframe {
        frame_type::KEY_FRAME
    } else {
        frame_type::INTER_FRAME
    };
    body.put_u8((kind << 4) | codec_id::AVC);
    body.put_u8(avc_packet_type::AVC_NALU);
    let cts = composition_time_ms.to_be_bytes();
    body.put_slice(&cts[1..]);
    body.put_slice(&avcc);
    body
}

const AAC_SOUND_FLAGS: u8 = (sound_format::AAC << 4) | 0x0F;

#[must_use]
pub fn aac_sequence_header_body(audio_specific_config: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(audio_specific_config.len() + 2);
    body.put_u8(AAC_SOUND_FLAGS);
    body.put_u8(aac_packet_type::AAC_SEQHDR);
    body.put_slice(audio_specific_config);
    body
}

#[must_use]
pub fn aac_raw_body(access_unit: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(access_unit.len() + 2);
    body.put_u8(AAC_SOUND_FLAGS);
    body.put_u8(aac_packet_type::AAC_RAW);
    body.put_slice(access_unit);
    body
}

/// G.711 tag body: 8 kHz mono 16-bit flags as players expect.
#[must_use]
pub fn g711_body(alaw: bool, samples: &[u8]) -> BytesMut {
    let format = if alaw { sound_format::G711A } else { sound_format::G711U };
    let mut body = BytesMut::with_capacity(samples.len() + 1);
    body.put_u8((format << 4) | 0x02);
    body.put_slice(samples);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::define::tag_type;
    use bytes::Bytes;

    #[test]
    fn test_header_layout() {
        let mut muxer = FlvMuxer::new();
        muxer.write_flv_header(true, true).unwrap();
        let bytes = muxer.extract();
        assert_eq!(&bytes[..], &[b'F', b'L', b'V', 1, 5, 0, 0, 0, 9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_tag_layout() {
        let mut muxer = FlvMuxer::new();
        muxer.write_tag(tag_type::VIDEO, 0x0102_0304, &[0xAA, 0xBB]).unwrap();
        let bytes = muxer.extract();
        assert_eq!(bytes[0], tag_type::VIDEO);
        assert_eq!(&bytes[1..4], &[0, 0, 2]);
        assert_eq!(&bytes[4..8], &[0x02, 0x03, 0x04, 0x01]);
        assert_eq!(&bytes[11..13], &[0xAA, 0xBB]);
        assert_eq!(&bytes[13..17], &[0, 0, 0, 13]);
    }

    #[test]
    fn test_nalu_body_strips_parameter_sets() {
        let au = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x11];
        let body = avc_nalu_body(true, 40, &au);
        assert_eq!(body[0], 0x17);
        assert_eq!(body[1], 1);
        assert_eq!(&body[2..5], &[0, 0, 40]);
        assert_eq!(&body[5..], &[0, 0, 0, 2, 0x65, 0x11]);
    }

    #[test]
    fn test_sequence_header_body() {
        let record = AvcDecoderConfigurationRecord::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]),
            Bytes::from_static(&[0x68, 0xce]),
        )
        .unwrap();
        let body = avc_sequence_header_body(&record).unwrap();
        assert_eq!(&body[..5], &[0x17, 0, 0, 0, 0]);
        assert_eq!(body[5], 1);
    }
}
