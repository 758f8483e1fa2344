use {
    crate::ps::write_timestamp,
    bytes::{BufMut, BytesMut},
};

const MAX_PTS: u64 = 0x1_FFFF_FFFF;

/// Milliseconds to a 33-bit 90 kHz timestamp.
#[must_use]
pub fn ms_to_90k(ms: i64) -> u64 {
    (ms.max(0) as u64 * 90) & MAX_PTS
}

/// Builds a PES header for `payload_len` bytes of elementary stream.
/// `dts` is only written when it differs from `pts`. Video PES longer than
/// 65535 bytes get an unbounded (zero) length as allowed by H.222.0.
#[must_use]
pub fn pes_header(stream_id: u8, pts: u64, dts: Option<u64>, payload_len: usize) -> BytesMut {
    let dts = dts.filter(|dts| *dts != pts);
    let header_data_len: usize = if dts.is_some() { 10 } else { 5 };
    let packet_len = 3 + header_data_len + payload_len;

    let mut out = BytesMut::with_capacity(9 + header_data_len);
    out.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    out.put_u16(u16::try_from(packet_len).unwrap_or(0));
    out.put_u8(0x80);
    match dts {
        Some(dts) => {
            out.put_u8(0xC0);
            out.put_u8(header_data_len as u8);
            out.put_slice(&write_timestamp(0x03, pts));
            out.put_slice(&write_timestamp(0x01, dts));
        }
        None => {
            out.put_u8(0x80);
            out.put_u8(header_data_len as u8);
            out.put_slice(&write_timestamp(0x02, pts));
        }
    }
    out
}

/// Parsed PES header: (header length, pts, dts).
#[must_use]
pub fn parse_pes_header(data: &[u8]) -> Option<(usize, Option<u64>, Option<u64>)> {
    if data.len() < 9 || data[..3] != [0, 0, 1] {
        return None;
    }
    let flags = data[7] >> 6;
    let header_len = 9 + usize::from(data[8]);
    if data.len() < header_len {
        return None;
    }
    let pts = (flags & 0x02 != 0 && header_len >= 14).then(|| crate::ps::read_timestamp(&data[9..14]));
    let dts = (flags == 0x03 && header_len >= 19).then(|| crate::ps::read_timestamp(&data[14..19]));
    Some((header_len, pts, dts.or(pts)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_with_dts() {
        let header = pes_header(0xE0, 9000, Some(6000), 100);
        assert_eq!(header.len(), 19);
        assert_eq!(parse_pes_header(&header), Some((19, Some(9000), Some(6000))));
        assert_eq!(u16::from_be_bytes([header[4], header[5]]), 3 + 10 + 100);
    }

    #[test]
    fn test_header_pts_only_and_unbounded() {
        let header = pes_header(0xE0, 9000, Some(9000), 70_000);
        assert_eq!(header.len(), 14);
        assert_eq!(&header[4..6], &[0, 0]);
        assert_eq!(parse_pes_header(&header), Some((14, Some(9000), Some(9000))));
    }

    #[test]
    fn test_ms_conversion() {
        assert_eq!(ms_to_90k(1000), 90_000);
        assert_eq!(ms_to_90k(-5), 0);
    }
}
