//! MPEG-2 program stream demuxer, as carried in GB28181 RTP payloads.
//!
//! ```text
//! | pack header (00 00 01 BA) | [system header BB] | [PSM BC] | PES E0.. | PES C0.. |
//! ```
//!
//! Input is one PS unit per call (the RTP layer groups packets by
//! timestamp). Video PES fragments of the unit are concatenated into one
//! access unit; each audio PES is one frame.

pub mod errors;

use {
    bytes::{BufMut, Bytes, BytesMut},
    errors::{PsError, PsErrorValue},
    std::collections::HashMap,
};

pub mod stream_type {
    pub const H264: u8 = 0x1B;
    pub const H265: u8 = 0x24;
    pub const AAC: u8 = 0x0F;
    pub const G711A: u8 = 0x90;
    pub const G711U: u8 = 0x91;
}

const PACK_START: u8 = 0xBA;
const SYSTEM_HEADER: u8 = 0xBB;
const PROGRAM_STREAM_MAP: u8 = 0xBC;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsFrame {
    pub stream_type: u8,
    pub video: bool,
    /// 90 kHz
    pub pts: u64,
    /// 90 kHz
    pub dts: u64,
    pub keyframe: bool,
    pub data: Bytes,
}

#[derive(Default)]
pub struct PsDemuxer {
    stream_types: HashMap<u8, u8>,
}

fn is_start_code(data: &[u8], at: usize) -> bool {
    at + 3 < data.len() && data[at] == 0 && data[at + 1] == 0 && data[at + 2] == 1
}

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len().saturating_sub(3)).find(|&i| is_start_code(data, i))
}

/// Decodes a 5-byte PES PTS/DTS field.
#[must_use]
pub fn read_timestamp(bytes: &[u8]) -> u64 {
    ((u64::from(bytes[0]) >> 1) & 0x07) << 30
        | u64::from(bytes[1]) << 22
        | (u64::from(bytes[2]) >> 1) << 15
        | u64::from(bytes[3]) << 7
        | u64::from(bytes[4]) >> 1
}

fn is_keyframe(stream_type: u8, data: &[u8]) -> bool {
    match stream_type {
        stream_type::H264 => crate::h264::is_keyframe_annexb(data),
        stream_type::H265 => crate::h264::split_annexb(data)
            .iter()
            .any(|nalu| (16..=21).contains(&((nalu[0] >> 1) & 0x3F))),
        _ => true,
    }
}

impl PsDemuxer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream type announced in the PSM for a PES stream id, if any.
    #[must_use]
    pub fn stream_type(&self, stream_id: u8) -> Option<u8> {
        self.stream_types.get(&stream_id).copied()
    }

    pub fn demux(&mut self, data: &[u8]) -> Result<Vec<EsFrame>, PsError> {
        let mut frames = Vec::new();
        let mut video: Option<(u8, u64, u64, BytesMut)> = None;
        let mut offset = find_start_code(data, 0).ok_or(PsErrorValue::NoStartCode)?;

        while offset + 4 <= data.len() {
            if !is_start_code(data, offset) {
                match find_start_code(data, offset) {
                    Some(next) => offset = next,
                    None => break,
                }
                continue;
            }
            let id = data[offset + 3];
            match id {
                PACK_START => offset = Self::skip_pack_header(data, offset)?,
                SYSTEM_HEADER => offset = Self::skip_length_prefixed(data, offset, "system header")?,
                PROGRAM_STREAM_MAP => offset = self.parse_psm(data, offset)?,
                0xE0..=0xEF | 0xC0..=0xDF => {
                    let (next, pts, dts, payload) = Self::parse_pes(data, offset)?;
                    offset = next;
                    if id >= 0xE0 {
                        let kind = self.stream_type(id).unwrap_or(stream_type::H264);
                        let append = match (&video, pts) {
                            (Some(_), None) => true,
                            (Some((_, current_pts, _, _)), Some(pts)) => *current_pts == pts,
                            _ => false,
                        };
                        if append {
                            if let Some((_, _, _, buffer)) = video.as_mut() {
                                buffer.put_slice(payload);
                            }
                        } else {
                            if let Some(done) = video.take() {
                                frames.push(Self::video_frame(done));
                            }
                            let pts = pts.unwrap_or_default();
                            let mut buffer = BytesMut::with_capacity(payload.len() * 2);
                            buffer.put_slice(payload);
                            video = Some((kind, pts, dts.unwrap_or(pts), buffer));
                        }
                    } else if !payload.is_empty() {
                        let kind = self.stream_type(id).unwrap_or(stream_type::G711A);
                        let pts = pts.unwrap_or_default();
                        frames.push(EsFrame {
                            stream_type: kind,
                            video: false,
                            pts,
                            dts: dts.unwrap_or(pts),
                            keyframe: true,
                            data: Bytes::copy_from_slice(payload),
                        });
                    }
                }
                _ => offset = Self::skip_length_prefixed(data, offset, "pes")?,
            }
        }

        if let Some(done) = video.take() {
            frames.push(Self::video_frame(done));
        }
        Ok(frames)
    }

    fn video_frame((kind, pts, dts, buffer): (u8, u64, u64, BytesMut)) -> EsFrame {
        let data = buffer.freeze();
        EsFrame {
            stream_type: kind,
            video: true,
            pts,
            dts,
            keyframe: is_keyframe(kind, &data),
            data,
        }
    }

    fn skip_pack_header(data: &[u8], offset: usize) -> Result<usize, PsError> {
        if offset + 5 > data.len() {
            return Err(PsErrorValue::Truncated { unit: "pack header", offset }.into());
        }
        // MPEG-1 pack headers start with '0010' instead of '01'
        if data[offset + 4] >> 6 != 0x01 {
            return Ok(offset + 12);
        }
        if offset + 14 > data.len() {
            return Err(PsErrorValue::Truncated { unit: "pack header", offset }.into());
        }
        let stuffing = usize::from(data[offset + 13] & 0x07);
        Ok(offset + 14 + stuffing)
    }

    fn skip_length_prefixed(data: &[u8], offset: usize, unit: &'static str) -> Result<usize, PsError> {
        if offset + 6 > data.len() {
            return Err(PsErrorValue::Truncated { unit, offset }.into());
        }
        let len = usize::from(u16::from_be_bytes([data[offset + 4], data[offset + 5]]));
        Ok((offset + 6 + len).min(data.len()))
    }

    fn parse_psm(&mut self, data: &[u8], offset: usize) -> Result<usize, PsError> {
        let end = Self::skip_length_prefixed(data, offset, "psm")?;
        let body = &data[offset + 6..end];
        if body.len() < 4 {
            return Ok(end);
        }
        let info_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
        let mut pos = 4 + info_len;
        if pos + 2 > body.len() {
            return Ok(end);
        }
        let map_len = usize::from(u16::from_be_bytes([body[pos], body[pos + 1]]));
        pos += 2;
        let map_end = (pos + map_len).min(body.len());
        while pos + 4 <= map_end {
            let kind = body[pos];
            let stream_id = body[pos + 1];
            let es_info_len = usize::from(u16::from_be_bytes([body[pos + 2], body[pos + 3]]));
            self.stream_types.insert(stream_id, kind);
            pos += 4 + es_info_len;
        }
        Ok(end)
    }

    #[allow(clippy::type_complexity)]
    fn parse_pes(data: &[u8], offset: usize) -> Result<(usize, Option<u64>, Option<u64>, &[u8]), PsError> {
        if offset + 9 > data.len() {
            return Err(PsErrorValue::Truncated { unit: "pes", offset }.into());
        }
        let len = usize::from(u16::from_be_bytes([data[offset + 4], data[offset + 5]]));
        let end = if len == 0 {
            find_start_code(data, offset + 9).unwrap_or(data.len())
        } else {
            (offset + 6 + len).min(data.len())
        };
        let flags = data[offset + 7];
        let header_len = usize::from(data[offset + 8]);
        let payload_start = offset + 9 + header_len;
        if payload_start > end {
            return Err(PsErrorValue::BadPesHeader.into());
        }
        let mut pts = None;
        let mut dts = None;
        if flags & 0x80 != 0 {
            if header_len < 5 {
                return Err(PsErrorValue::BadPesHeader.into());
            }
            pts = Some(read_timestamp(&data[offset + 9..offset + 14]));
        }
        if flags & 0x40 != 0 {
            if header_len < 10 {
                return Err(PsErrorValue::BadPesHeader.into());
            }
            dts = Some(read_timestamp(&data[offset + 14..offset + 19]));
        }
        Ok((end, pts, dts, &data[payload_start..end]))
    }
}

/// Encodes a 33-bit PTS/DTS in the 5-byte PES layout.
#[must_use]
pub fn write_timestamp(marker: u8, ts: u64) -> [u8; 5] {
    [
        (marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1,
        (ts >> 22) as u8,
        (((ts >> 15) & 0x7F) as u8) << 1 | 1,
        (ts >> 7) as u8,
        ((ts & 0x7F) as u8) << 1 | 1,
    ]
}

/// Builds one PS unit (pack header + PSM + video PES) around an access unit,
/// the way GB28181 devices frame their payload.
#[must_use]
pub fn mux_video_unit(es: &[u8], pts: u64, kind: u8) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(&[0, 0, 1, PACK_START, 0x44, 0, 4, 0, 4, 1, 0x01, 0x89, 0xc3, 0xf8]);
    out.put_slice(&[0, 0, 1, PROGRAM_STREAM_MAP, 0, 14, 0xe0, 0xff, 0, 0, 0, 4, kind, 0xe0, 0, 0]);
    out.put_slice(&[0, 0, 0, 0]);
    for chunk in es.chunks(60_000) {
        out.put_slice(&[0, 0, 1, 0xE0]);
        out.put_u16((chunk.len() + 8) as u16);
        out.put_slice(&[0x80, 0x80, 5]);
        out.put_slice(&write_timestamp(0x02, pts));
        out.put_slice(chunk);
    }
    out.freeze()
}
