//! AAC configuration and ADTS framing.

use bytes::{BufMut, Bytes, BytesMut};

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

pub const ADTS_HEADER_LEN: usize = 7;

/// AudioSpecificConfig (ISO/IEC 14496-3 1.6.2.1), first two bytes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let object_type = data[0] >> 3;
        let sampling_frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channel_configuration = (data[1] >> 3) & 0x0F;
        if usize::from(sampling_frequency_index) >= SAMPLE_RATES.len() {
            return None;
        }
        Some(Self {
            object_type,
            sampling_frequency_index,
            channel_configuration,
        })
    }

    /// AAC-LC config for a sample rate / channel count, if the rate is standard.
    #[must_use]
    pub fn lc(sample_rate: u32, channels: u8) -> Option<Self> {
        let index = SAMPLE_RATES.iter().position(|rate| *rate == sample_rate)?;
        Some(Self {
            object_type: 2,
            sampling_frequency_index: index as u8,
            channel_configuration: channels,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&[
            (self.object_type << 3) | (self.sampling_frequency_index >> 1),
            ((self.sampling_frequency_index & 0x01) << 7) | (self.channel_configuration << 3),
        ])
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES
            .get(usize::from(self.sampling_frequency_index))
            .copied()
            .unwrap_or(44100)
    }

    /// Builds the ADTS header for one raw access unit of `payload_len` bytes.
    #[must_use]
    pub fn adts_header(&self, payload_len: usize) -> [u8; ADTS_HEADER_LEN] {
        let frame_len = (payload_len + ADTS_HEADER_LEN) as u32;
        let profile = self.object_type.saturating_sub(1) & 0x03;
        [
            0xFF,
            0xF1,
            (profile << 6) | (self.sampling_frequency_index << 2) | ((self.channel_configuration >> 2) & 0x01),
            ((self.channel_configuration & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ]
    }

    #[must_use]
    pub fn wrap_adts(&self, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(payload.len() + ADTS_HEADER_LEN);
        out.put_slice(&self.adts_header(payload.len()));
        out.put_slice(payload);
        out
    }
}

/// Splits a buffer of ADTS frames into (config, raw access unit) pairs.
/// Trailing partial frames are ignored.
#[must_use]
pub fn split_adts(data: &[u8]) -> Vec<(AudioSpecificConfig, Bytes)> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + ADTS_HEADER_LEN <= data.len() {
        let header = &data[offset..];
        if header[0] != 0xFF || header[1] & 0xF0 != 0xF0 {
            break;
        }
        let protection_absent = header[1] & 0x01 == 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let frame_len = ((usize::from(header[3] & 0x03)) << 11)
            | (usize::from(header[4]) << 3)
            | usize::from(header[5] >> 5);
        if frame_len < header_len || offset + frame_len > data.len() {
            break;
        }
        let config = AudioSpecificConfig {
            object_type: ((header[2] >> 6) & 0x03) + 1,
            sampling_frequency_index: (header[2] >> 2) & 0x0F,
            channel_configuration: ((header[2] & 0x01) << 2) | (header[3] >> 6),
        };
        frames.push((
            config,
            Bytes::copy_from_slice(&data[offset + header_len..offset + frame_len]),
        ));
        offset += frame_len;
    }
    frames
}
