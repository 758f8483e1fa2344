//! H.264 elementary stream helpers.
//!
//! Frames travel through the gateway as Annex-B access units (start-code
//! prefixed). Containers that want length-prefixed NAL units (FLV, fMP4)
//! convert on the way out; RTP and MPEG-TS take Annex-B directly.

pub mod config;
pub mod errors;
pub mod sps;

use bytes::{BufMut, Bytes, BytesMut};
use errors::{H264Error, H264ErrorValue};

pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub mod nal_type {
    pub const NON_IDR: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    pub const STAP_A: u8 = 24;
    pub const FU_A: u8 = 28;
}

#[inline]
#[must_use]
pub fn nal_unit_type(header: u8) -> u8 {
    header & 0x1F
}

/// Splits an Annex-B buffer into NAL units (start codes stripped).
/// Data before the first start code is treated as a NAL unit if present.
#[must_use]
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            match start {
                Some(s) if code_start > s => units.push(&data[s..code_start]),
                None if code_start > 0 => units.push(&data[..code_start]),
                _ => {}
            }
            i += 3;
            start = Some(i);
            continue;
        }
        i += 1;
    }

    match start {
        Some(s) if s < data.len() => units.push(&data[s..]),
        None if !data.is_empty() => units.push(data),
        _ => {}
    }
    units.retain(|nalu| !nalu.is_empty());
    units
}

/// True when the access unit carries an IDR slice.
#[must_use]
pub fn is_keyframe_annexb(data: &[u8]) -> bool {
    split_annexb(data)
        .iter()
        .any(|nalu| nal_unit_type(nalu[0]) == nal_type::IDR)
}

/// Returns the first SPS and PPS found in an Annex-B access unit.
#[must_use]
pub fn extract_parameter_sets(data: &[u8]) -> (Option<Bytes>, Option<Bytes>) {
    let mut sps = None;
    let mut pps = None;
    for nalu in split_annexb(data) {
        match nal_unit_type(nalu[0]) {
            nal_type::SPS if sps.is_none() => sps = Some(Bytes::copy_from_slice(nalu)),
            nal_type::PPS if pps.is_none() => pps = Some(Bytes::copy_from_slice(nalu)),
            _ => {}
        }
    }
    (sps, pps)
}

/// Joins NAL units into an Annex-B buffer.
#[must_use]
pub fn to_annexb<'a>(units: impl IntoIterator<Item = &'a [u8]>) -> BytesMut {
    let mut out = BytesMut::new();
    for nalu in units {
        out.put_slice(&START_CODE);
        out.put_slice(nalu);
    }
    out
}

/// Converts Annex-B to 4-byte length-prefixed NAL units, dropping access
/// unit delimiters and (optionally) in-band parameter sets.
#[must_use]
pub fn annexb_to_avcc(data: &[u8], keep_parameter_sets: bool) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    for nalu in split_annexb(data) {
        let nal_type = nal_unit_type(nalu[0]);
        if nal_type == nal_type::AUD {
            continue;
        }
        if !keep_parameter_sets && (nal_type == nal_type::SPS || nal_type == nal_type::PPS) {
            continue;
        }
        out.put_u32(nalu.len() as u32);
        out.put_slice(nalu);
    }
    out
}

/// Converts length-prefixed NAL units (as found in FLV/MP4) to Annex-B.
pub fn avcc_to_annexb(data: &[u8], length_size: usize) -> Result<BytesMut, H264Error> {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    let mut offset = 0;
    while offset + length_size <= data.len() {
        let mut length = 0usize;
        for byte in &data[offset..offset + length_size] {
            length = (length << 8) | usize::from(*byte);
        }
        offset += length_size;
        let remaining = data.len() - offset;
        if length > remaining {
            return Err(H264ErrorValue::BadNaluLength { length, remaining }.into());
        }
        out.put_slice(&START_CODE);
        out.put_slice(&data[offset..offset + length]);
        offset += length;
    }
    Ok(out)
}

/// Removes emulation prevention bytes (00 00 03 -> 00 00) from a NAL unit.
#[must_use]
pub fn unescape_rbsp(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0;
    for &byte in nalu {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}
