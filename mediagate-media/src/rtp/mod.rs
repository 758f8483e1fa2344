//! RTP (RFC 3550) packets and payload formats.

pub mod aac;
pub mod errors;
pub mod h264;

use {
    bytes::{BufMut, Bytes, BytesMut},
    errors::{RtpError, RtpErrorValue},
};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parses one packet. Header extensions are skipped and padding removed.
    pub fn parse(data: Bytes) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpErrorValue::TooShort(data.len()).into());
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpErrorValue::BadVersion(version).into());
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = usize::from(data[0] & 0x0F);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if data.len() < offset {
            return Err(RtpErrorValue::TooShort(data.len()).into());
        }
        let csrcs = (0..csrc_count)
            .map(|i| {
                let at = RTP_HEADER_LEN + i * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();

        if extension {
            if data.len() < offset + 4 {
                return Err(RtpErrorValue::TooShort(data.len()).into());
            }
            let words = usize::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
            offset += 4 + words * 4;
            if data.len() < offset {
                return Err(RtpErrorValue::TooShort(data.len()).into());
            }
        }

        let mut end = data.len();
        if padding {
            let pad = usize::from(data[end - 1]);
            if pad == 0 || end - offset < pad {
                return Err(RtpErrorValue::BadPadding.into());
            }
            end -= pad;
        }

        Ok(Self {
            header: RtpHeader {
                marker: data[1] & 0x80 != 0,
                payload_type: data[1] & 0x7F,
                sequence_number: u16::from_be_bytes([data[2], data[3]]),
                timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                csrcs,
            },
            payload: data.slice(offset..end),
        })
    }

    #[must_use]
    pub fn marshal(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(RTP_HEADER_LEN + self.header.csrcs.len() * 4 + self.payload.len());
        out.put_u8((RTP_VERSION << 6) | (self.header.csrcs.len() as u8 & 0x0F));
        out.put_u8((u8::from(self.header.marker) << 7) | (self.header.payload_type & 0x7F));
        out.put_u16(self.header.sequence_number);
        out.put_u32(self.header.timestamp);
        out.put_u32(self.header.ssrc);
        for csrc in &self.header.csrcs {
            out.put_u32(*csrc);
        }
        out.put_slice(&self.payload);
        out
    }
}

/// Tracks sequence numbers for one SSRC and reports gaps.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
    pub lost: u64,
    pub reordered: u64,
}

impl SequenceTracker {
    /// Returns false when the packet is a late duplicate or out of order and
    /// should be ignored.
    pub fn accept(&mut self, seq: u16) -> bool {
        let Some(last) = self.last else {
            self.last = Some(seq);
            return true;
        };
        let delta = seq.wrapping_sub(last);
        if delta == 0 || delta > 0x8000 {
            self.reordered += 1;
            return false;
        }
        self.lost += u64::from(delta - 1);
        self.last = Some(seq);
        true
    }
}

/// Converts a 32-bit RTP timestamp stream into a monotonic 64-bit one,
/// handling wrap-around.
#[derive(Debug, Default)]
pub struct TimestampUnwrapper {
    last: Option<u32>,
    high: u64,
}

impl TimestampUnwrapper {
    pub fn unwrap_ts(&mut self, ts: u32) -> u64 {
        if let Some(last) = self.last {
            if ts < last && last - ts > 0x8000_0000 {
                self.high += 1 << 32;
            }
        }
        self.last = Some(ts);
        self.high + u64::from(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_parse() {
        let packet = RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: 96,
                sequence_number: 65535,
                timestamp: 90_000,
                ssrc: 0xdead_beef,
                csrcs: vec![],
            },
            payload: Bytes::from_static(&[0x65, 0x01]),
        };
        let bytes = packet.marshal().freeze();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x80 | 96);
        assert_eq!(RtpPacket::parse(bytes).unwrap(), packet);
    }

    #[test]
    fn test_parse_padding_and_extension() {
        let mut raw = vec![0xB0, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2];
        raw.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4]);
        raw.extend_from_slice(&[0xAA, 0xBB]);
        raw.extend_from_slice(&[0x00, 0x02]);
        let packet = RtpPacket::parse(Bytes::from(raw)).unwrap();
        assert_eq!(&packet.payload[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_parse_rejects_short() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0x80, 96])).is_err());
        assert!(RtpPacket::parse(Bytes::from_static(&[0x40; 12])).is_err());
    }

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::default();
        assert!(tracker.accept(65534));
        assert!(tracker.accept(65535));
        assert!(tracker.accept(2));
        assert_eq!(tracker.lost, 2);
        assert!(!tracker.accept(1));
        assert_eq!(tracker.reordered, 1);
    }

    #[test]
    fn test_timestamp_unwrap() {
        let mut unwrapper = TimestampUnwrapper::default();
        assert_eq!(unwrapper.unwrap_ts(u32::MAX - 10), u64::from(u32::MAX - 10));
        assert_eq!(unwrapper.unwrap_ts(5), (1u64 << 32) + 5);
    }
}
