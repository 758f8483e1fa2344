use {
    super::{
        define::{pid, table_id, SYNC_BYTE, TS_PACKET_SIZE},
        errors::{MpegTsError, MpegTsErrorValue},
        pes::parse_pes_header,
    },
    bytes::{Bytes, BytesMut},
    std::collections::BTreeMap,
};

/// One reassembled PES payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsFrame {
    pub pid: u16,
    pub stream_type: u8,
    /// 90 kHz
    pub pts: u64,
    pub dts: u64,
    pub random_access: bool,
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct PesBuffer {
    data: BytesMut,
    random_access: bool,
}

/// Reassembles PES packets from 188-byte TS packets. Used to inspect
/// recorded segments; it understands a single program.
#[derive(Debug, Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    streams: BTreeMap<u16, u8>,
    pending: BTreeMap<u16, PesBuffer>,
    partial: BytesMut,
}

impl TsDemuxer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes; packets may be split across calls.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<TsFrame>, MpegTsError> {
        self.partial.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;
        while self.partial.len() - offset >= TS_PACKET_SIZE {
            if self.partial[offset] != SYNC_BYTE {
                return Err(MpegTsErrorValue::LostSync(offset).into());
            }
            let packet = self.partial[offset..offset + TS_PACKET_SIZE].to_vec();
            self.packet(&packet, &mut frames);
            offset += TS_PACKET_SIZE;
        }
        let _ = self.partial.split_to(offset);
        Ok(frames)
    }

    /// Emits PES payloads still waiting for their next start indicator.
    pub fn flush(&mut self) -> Vec<TsFrame> {
        let pids: Vec<u16> = self.pending.keys().copied().collect();
        pids.into_iter()
            .filter_map(|pid| {
                let buffer = self.pending.remove(&pid)?;
                self.finish(pid, buffer)
            })
            .collect()
    }

    #[must_use]
    pub fn stream_type(&self, pid: u16) -> Option<u8> {
        self.streams.get(&pid).copied()
    }

    fn packet(&mut self, packet: &[u8], frames: &mut Vec<TsFrame>) {
        let start = packet[1] & 0x40 != 0;
        let packet_pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
        let control = (packet[3] >> 4) & 0x03;

        let mut offset = 4;
        let mut random_access = false;
        if control & 0x02 != 0 {
            let af_len = usize::from(packet[4]);
            if af_len > 0 {
                random_access = packet[5] & 0x40 != 0;
            }
            offset += 1 + af_len;
        }
        if control & 0x01 == 0 || offset >= TS_PACKET_SIZE {
            return;
        }
        let payload = &packet[offset..];

        if packet_pid == pid::PAT {
            if start {
                self.parse_pat(payload);
            }
            return;
        }
        if Some(packet_pid) == self.pmt_pid {
            if start {
                self.parse_pmt(payload);
            }
            return;
        }
        if !self.streams.contains_key(&packet_pid) {
            return;
        }

        if start {
            if let Some(previous) = self.pending.remove(&packet_pid) {
                frames.extend(self.finish(packet_pid, previous));
            }
            self.pending.insert(
                packet_pid,
                PesBuffer {
                    data: BytesMut::from(payload),
                    random_access,
                },
            );
        } else if let Some(buffer) = self.pending.get_mut(&packet_pid) {
            buffer.data.extend_from_slice(payload);
        }

        // bounded PES can be emitted as soon as it is complete
        let complete = self.pending.get(&packet_pid).is_some_and(|buffer| {
            let data = &buffer.data;
            data.len() >= 6 && {
                let len = usize::from(u16::from_be_bytes([data[4], data[5]]));
                len > 0 && data.len() >= 6 + len
            }
        });
        if complete {
            if let Some(buffer) = self.pending.remove(&packet_pid) {
                frames.extend(self.finish(packet_pid, buffer));
            }
        }
    }

    fn section(payload: &[u8], expected_table: u8) -> Option<&[u8]> {
        let pointer = usize::from(*payload.first()?);
        let section = payload.get(1 + pointer..)?;
        if section.first() != Some(&expected_table) || section.len() < 3 {
            return None;
        }
        let len = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
        section.get(..3 + len)
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(section) = Self::section(payload, table_id::PAT) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        // programs start at 8, crc takes the last 4 bytes
        let programs = &section[8..section.len() - 4];
        for entry in programs.chunks_exact(4) {
            let program_number = u16::from_be_bytes([entry[0], entry[1]]);
            if program_number != 0 {
                self.pmt_pid = Some((u16::from(entry[2] & 0x1F) << 8) | u16::from(entry[3]));
                return;
            }
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some(section) = Self::section(payload, table_id::PMT) else {
            return;
        };
        if section.len() < 16 {
            return;
        }
        let info_len = (usize::from(section[10] & 0x0F) << 8) | usize::from(section[11]);
        let mut offset = 12 + info_len;
        let end = section.len() - 4;
        while offset + 5 <= end {
            let stream_type = section[offset];
            let es_pid = (u16::from(section[offset + 1] & 0x1F) << 8) | u16::from(section[offset + 2]);
            let es_info_len =
                (usize::from(section[offset + 3] & 0x0F) << 8) | usize::from(section[offset + 4]);
            self.streams.insert(es_pid, stream_type);
            offset += 5 + es_info_len;
        }
    }

    fn finish(&self, pid: u16, buffer: PesBuffer) -> Option<TsFrame> {
        let (header_len, pts, dts) = parse_pes_header(&buffer.data)?;
        let declared = usize::from(u16::from_be_bytes([buffer.data[4], buffer.data[5]]));
        let end = if declared > 0 {
            (6 + declared).min(buffer.data.len())
        } else {
            buffer.data.len()
        };
        let pts = pts?;
        Some(TsFrame {
            pid,
            stream_type: self.streams.get(&pid).copied().unwrap_or_default(),
            pts,
            dts: dts.unwrap_or(pts),
            random_access: buffer.random_access,
            data: buffer.data.freeze().slice(header_len..end.max(header_len)),
        })
    }
}

/// First and last PTS (90 kHz) found in a transport stream buffer; a
/// truncated trailing packet is ignored.
#[must_use]
pub fn pts_span(data: &[u8]) -> Option<(u64, u64)> {
    let whole = data.len() - data.len() % TS_PACKET_SIZE;
    let mut demuxer = TsDemuxer::new();
    let mut frames = demuxer.push(&data[..whole]).ok()?;
    frames.extend(demuxer.flush());
    let first = frames.iter().map(|f| f.pts).min()?;
    let last = frames.iter().map(|f| f.pts).max()?;
    Some((first, last))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::mpegts::{define::stream_type, muxer::TsMuxer},
    };

    #[test]
    fn test_split_input_and_span() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), None).unwrap();
        muxer.write_video(0, 0, true, &[0, 0, 0, 1, 0x65, 1, 2, 3]).unwrap();
        muxer.write_video(2000, 2000, false, &[0, 0, 0, 1, 0x41, 4]).unwrap();
        let data = muxer.take();

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&data[..100]).unwrap();
        frames.extend(demuxer.push(&data[100..]).unwrap());
        frames.extend(demuxer.flush());
        assert_eq!(frames.len(), 2);
        assert_eq!(demuxer.stream_type(pid::VIDEO), Some(stream_type::H264));

        // truncated tail still yields the complete part
        assert_eq!(pts_span(&data[..data.len() - 50]), Some((0, 0)));
        assert_eq!(pts_span(&data), Some((0, 180_000)));
    }

    #[test]
    fn test_lost_sync() {
        let mut demuxer = TsDemuxer::new();
        assert!(demuxer.push(&[0u8; TS_PACKET_SIZE]).is_err());
    }
}
