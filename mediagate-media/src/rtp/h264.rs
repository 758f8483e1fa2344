//! H.264 RTP payload format (RFC 6184): single NAL unit, STAP-A and FU-A.

use {
    super::{
        errors::{RtpError, RtpErrorValue},
        RtpHeader, RtpPacket,
    },
    crate::h264::{nal_type, nal_unit_type, split_annexb, START_CODE},
    bytes::{BufMut, Bytes, BytesMut},
};

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// A reassembled access unit in Annex-B form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub timestamp: u32,
    pub data: Bytes,
    pub keyframe: bool,
}

#[derive(Default)]
pub struct H264Depacketizer {
    nalus: Vec<Bytes>,
    fragment: Option<BytesMut>,
    timestamp: Option<u32>,
    last_seq: Option<u16>,
    corrupt: bool,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl H264Depacketizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Out-of-band parameter sets (e.g. SDP `sprop-parameter-sets`), used
    /// when an IDR arrives without in-band SPS/PPS.
    pub fn set_parameter_sets(&mut self, sps: Bytes, pps: Bytes) {
        self.sps = Some(sps);
        self.pps = Some(pps);
    }

    /// Feeds one packet. Completed access units are appended to `out`. An
    /// error means a unit was damaged and dropped; `out` is still valid.
    pub fn push(&mut self, packet: &RtpPacket, out: &mut Vec<AccessUnit>) -> Result<(), RtpError> {
        let mut error = None;

        if let Some(last) = self.last_seq {
            let expected = last.wrapping_add(1);
            if packet.header.sequence_number != expected {
                self.fragment = None;
                self.corrupt = true;
                error = Some(RtpErrorValue::FragmentLost {
                    expected,
                    got: packet.header.sequence_number,
                });
            }
        }
        self.last_seq = Some(packet.header.sequence_number);

        if self.timestamp.is_some_and(|ts| ts != packet.header.timestamp) {
            if let Err(err) = self.flush(out) {
                error.get_or_insert(err);
            }
        }
        self.timestamp = Some(packet.header.timestamp);

        if let Err(err) = self.depacketize(&packet.payload) {
            self.corrupt = true;
            error.get_or_insert(err);
        }

        if packet.header.marker {
            if let Err(err) = self.flush(out) {
                error.get_or_insert(err);
            }
        }

        match error {
            Some(value) => Err(value.into()),
            None => Ok(()),
        }
    }

    fn depacketize(&mut self, payload: &Bytes) -> Result<(), RtpErrorValue> {
        let Some(&header) = payload.first() else {
            return Ok(());
        };
        match nal_unit_type(header) {
            1..=23 => self.nalus.push(payload.clone()),
            nal_type::STAP_A => {
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size = usize::from(u16::from_be_bytes([payload[offset], payload[offset + 1]]));
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        return Err(RtpErrorValue::BadAggregation);
                    }
                    self.nalus.push(payload.slice(offset..offset + size));
                    offset += size;
                }
            }
            nal_type::FU_A => {
                if payload.len() < 2 {
                    return Err(RtpErrorValue::FragmentWithoutStart);
                }
                let fu_header = payload[1];
                if fu_header & FU_START != 0 {
                    let mut fragment = BytesMut::with_capacity(payload.len() * 4);
                    fragment.put_u8((header & 0xE0) | (fu_header & 0x1F));
                    fragment.put_slice(&payload[2..]);
                    self.fragment = Some(fragment);
                } else {
                    let Some(fragment) = self.fragment.as_mut() else {
                        return Err(RtpErrorValue::FragmentWithoutStart);
                    };
                    fragment.put_slice(&payload[2..]);
                }
                if fu_header & FU_END != 0 {
                    if let Some(fragment) = self.fragment.take() {
                        self.nalus.push(fragment.freeze());
                    }
                }
            }
            other => return Err(RtpErrorValue::UnsupportedNalType(other)),
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<AccessUnit>) -> Result<(), RtpErrorValue> {
        let nalus = std::mem::take(&mut self.nalus);
        let timestamp = self.timestamp.unwrap_or_default();
        if self.corrupt {
            self.corrupt = false;
            self.fragment = None;
            if !nalus.is_empty() {
                return Err(RtpErrorValue::DamagedUnit(nalus.len()));
            }
            return Ok(());
        }
        if nalus.is_empty() {
            return Ok(());
        }

        let mut keyframe = false;
        let mut has_sps = false;
        let mut has_pps = false;
        for nalu in &nalus {
            match nal_unit_type(nalu[0]) {
                nal_type::IDR => keyframe = true,
                nal_type::SPS => {
                    has_sps = true;
                    self.sps = Some(nalu.clone());
                }
                nal_type::PPS => {
                    has_pps = true;
                    self.pps = Some(nalu.clone());
                }
                _ => {}
            }
        }

        let mut data = BytesMut::new();
        if keyframe && !(has_sps && has_pps) {
            if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                for nalu in [sps, pps] {
                    data.put_slice(&START_CODE);
                    data.put_slice(nalu);
                }
            }
        }
        for nalu in &nalus {
            data.put_slice(&START_CODE);
            data.put_slice(nalu);
        }
        out.push(AccessUnit {
            timestamp,
            data: data.freeze(),
            keyframe,
        });
        Ok(())
    }
}

pub struct H264Packetizer {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
}

impl H264Packetizer {
    #[must_use]
    pub fn new(mtu: usize, payload_type: u8, ssrc: u32) -> Self {
        Self {
            mtu: mtu.max(64),
            payload_type,
            ssrc,
            sequence: rand_sequence(ssrc),
        }
    }

    #[must_use]
    pub const fn next_sequence(&self) -> u16 {
        self.sequence
    }

    fn packet(&mut self, timestamp: u32, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            header: RtpHeader {
                marker: false,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp,
                ssrc: self.ssrc,
                csrcs: Vec::new(),
            },
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    /// Packetizes one Annex-B access unit; the marker bit is set on the last
    /// packet.
    pub fn packetize(&mut self, annexb: &[u8], timestamp: u32) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        for nalu in split_annexb(annexb) {
            if nal_unit_type(nalu[0]) == nal_type::AUD {
                continue;
            }
            if nalu.len() <= self.mtu {
                let packet = self.packet(timestamp, Bytes::copy_from_slice(nalu));
                packets.push(packet);
                continue;
            }
            let indicator = (nalu[0] & 0xE0) | nal_type::FU_A;
            let nal_kind = nal_unit_type(nalu[0]);
            let body = &nalu[1..];
            let chunk_size = self.mtu - 2;
            let chunks = body.chunks(chunk_size).collect::<Vec<_>>();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let mut fu_header = nal_kind;
                if i == 0 {
                    fu_header |= FU_START;
                }
                if i == last {
                    fu_header |= FU_END;
                }
                let mut payload = BytesMut::with_capacity(chunk.len() + 2);
                payload.put_u8(indicator);
                payload.put_u8(fu_header);
                payload.put_slice(chunk);
                let packet = self.packet(timestamp, payload.freeze());
                packets.push(packet);
            }
        }
        if let Some(last) = packets.last_mut() {
            last.header.marker = true;
        }
        packets
    }
}

fn rand_sequence(seed: u32) -> u16 {
    (seed ^ (seed >> 16)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                marker,
                payload_type: 96,
                sequence_number: seq,
                timestamp: ts,
                ssrc: 1,
                csrcs: vec![],
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_single_nal_and_stap_a() {
        let mut depacketizer = H264Depacketizer::new();
        let mut out = Vec::new();
        // STAP-A carrying SPS + PPS
        depacketizer
            .push(&packet(1, 3000, false, &[0x18, 0, 2, 0x67, 0x42, 0, 2, 0x68, 0xce]), &mut out)
            .unwrap();
        depacketizer.push(&packet(2, 3000, true, &[0x65, 0xaa]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].keyframe);
        assert_eq!(
            &out[0].data[..],
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0xaa]
        );
    }

    #[test]
    fn test_fu_a_roundtrip_through_packetizer() {
        let mut nalu = vec![0x65];
        nalu.extend((0..3000).map(|i| (i % 251) as u8));
        let mut au = START_CODE.to_vec();
        au.extend_from_slice(&nalu);

        let mut packetizer = H264Packetizer::new(1200, 96, 7);
        let packets = packetizer.packetize(&au, 9000);
        assert_eq!(packets.len(), 3);
        assert!(packets.last().unwrap().header.marker);
        assert!(!packets[0].header.marker);

        let mut depacketizer = H264Depacketizer::new();
        let mut out = Vec::new();
        for p in &packets {
            depacketizer.push(p, &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &au[..]);
        assert_eq!(out[0].timestamp, 9000);
    }

    #[test]
    fn test_lost_fragment_drops_unit() {
        let mut depacketizer = H264Depacketizer::new();
        let mut out = Vec::new();
        depacketizer.push(&packet(10, 100, false, &[0x7c, 0x85, 1, 2]), &mut out).unwrap();
        // seq 11 lost
        let err = depacketizer.push(&packet(12, 100, true, &[0x7c, 0x45, 3, 4]), &mut out);
        assert!(err.is_err());
        assert!(out.is_empty());

        // next unit decodes cleanly
        depacketizer.push(&packet(13, 200, true, &[0x41, 0x9a]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].keyframe);
    }

    #[test]
    fn test_timestamp_change_flushes_without_marker() {
        let mut depacketizer = H264Depacketizer::new();
        let mut out = Vec::new();
        depacketizer.push(&packet(1, 100, false, &[0x41, 0x01]), &mut out).unwrap();
        depacketizer.push(&packet(2, 200, false, &[0x41, 0x02]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 100);
    }

    #[test]
    fn test_keyframe_gets_out_of_band_parameter_sets() {
        let mut depacketizer = H264Depacketizer::new();
        depacketizer.set_parameter_sets(Bytes::from_static(&[0x67, 1]), Bytes::from_static(&[0x68, 2]));
        let mut out = Vec::new();
        depacketizer.push(&packet(1, 100, true, &[0x65, 0x03]), &mut out).unwrap();
        assert_eq!(&out[0].data[..], &[0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x68, 2, 0, 0, 0, 1, 0x65, 3]);
    }
}
