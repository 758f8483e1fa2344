//! MPEG-4 audio RTP payload (RFC 3640, AAC-hbr mode: 13-bit size, 3-bit index).

use {
    super::{
        errors::{RtpError, RtpErrorValue},
        RtpHeader, RtpPacket,
    },
    bytes::{BufMut, Bytes, BytesMut},
};

pub const SAMPLES_PER_FRAME: u32 = 1024;

/// Splits one packet into raw AAC access units with their RTP timestamps.
pub fn depacketize(packet: &RtpPacket) -> Result<Vec<(u32, Bytes)>, RtpError> {
    let payload = &packet.payload;
    if payload.len() < 2 {
        return Err(RtpErrorValue::BadAuHeaders.into());
    }
    let headers_bits = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
    let headers_len = headers_bits.div_ceil(8);
    if headers_bits % 16 != 0 || payload.len() < 2 + headers_len {
        return Err(RtpErrorValue::BadAuHeaders.into());
    }

    let mut units = Vec::with_capacity(headers_bits / 16);
    let mut offset = 2 + headers_len;
    for (i, header) in payload[2..2 + headers_len].chunks_exact(2).enumerate() {
        let size = usize::from(u16::from_be_bytes([header[0], header[1]]) >> 3);
        if offset + size > payload.len() {
            return Err(RtpErrorValue::BadAuHeaders.into());
        }
        let timestamp = packet
            .header
            .timestamp
            .wrapping_add(i as u32 * SAMPLES_PER_FRAME);
        units.push((timestamp, payload.slice(offset..offset + size)));
        offset += size;
    }
    Ok(units)
}

pub struct AacPacketizer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
}

impl AacPacketizer {
    #[must_use]
    pub const fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: 0,
        }
    }

    /// One access unit per packet.
    pub fn packetize(&mut self, access_unit: &[u8], timestamp: u32) -> RtpPacket {
        let size = access_unit.len() as u16;
        let mut payload = BytesMut::with_capacity(access_unit.len() + 4);
        payload.put_u16(16);
        payload.put_u16(size << 3);
        payload.put_slice(access_unit);
        let packet = RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp,
                ssrc: self.ssrc,
                csrcs: Vec::new(),
            },
            payload: payload.freeze(),
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packetize_depacketize() {
        let mut packetizer = AacPacketizer::new(97, 5);
        let packet = packetizer.packetize(&[1, 2, 3, 4, 5], 48_000);
        let units = depacketize(&packet).unwrap();
        assert_eq!(units, vec![(48_000, Bytes::from_static(&[1, 2, 3, 4, 5]))]);
    }

    #[test]
    fn test_multiple_access_units() {
        let payload = Bytes::from_static(&[0x00, 0x20, 0x00, 0x10, 0x00, 0x08, 0xa, 0xb, 0xc]);
        let packet = RtpPacket {
            header: RtpHeader {
                timestamp: 1000,
                ..Default::default()
            },
            payload,
        };
        let units = depacketize(&packet).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0].1[..], &[0xa, 0xb]);
        assert_eq!(units[1].0, 1000 + SAMPLES_PER_FRAME);
        assert_eq!(&units[1].1[..], &[0xc]);
    }

    #[test]
    fn test_bad_headers() {
        let packet = RtpPacket {
            header: RtpHeader::default(),
            payload: Bytes::from_static(&[0x00, 0x10, 0xff, 0xf8]),
        };
        assert!(depacketize(&packet).is_err());
    }
}
