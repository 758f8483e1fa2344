use {
    super::{
        errors::{RtmpError, RtmpErrorValue},
        message::{msg_type, RtmpMessage},
    },
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    bytes::{Buf, BufMut, BytesMut},
    std::collections::HashMap,
    tokio_util::codec::{Decoder, Encoder},
};

pub const DEFAULT_CHUNK_SIZE: usize = 128;
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const MAX_CHUNK_STREAMS: usize = 256;
const EXTENDED_TIMESTAMP: u32 = 0x00FF_FFFF;

#[derive(Debug, Default)]
struct ChunkStreamState {
    timestamp: u32,
    delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    payload: BytesMut,
}

/// Chunk stream (de)multiplexer.
///
/// The decoder reassembles messages across interleaved chunk streams and
/// applies inbound `SetChunkSize` itself, so chunks that are already buffered
/// behind it are split with the new size. The encoder writes a type 0 header
/// for the first chunk of every message and type 3 for continuations.
#[derive(Debug)]
pub struct ChunkCodec {
    in_chunk_size: usize,
    out_chunk_size: usize,
    streams: HashMap<u32, ChunkStreamState>,
    bytes_read: u64,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the peer, used for acknowledgements.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    #[must_use]
    pub const fn in_chunk_size(&self) -> usize {
        self.in_chunk_size
    }

    #[must_use]
    pub const fn out_chunk_size(&self) -> usize {
        self.out_chunk_size
    }

    /// Parses one chunk from the front of `src`. Returns `Ok(None)` without
    /// consuming anything when the chunk is not fully buffered yet.
    fn decode_chunk(&mut self, src: &mut BytesMut) -> Result<Option<RtmpMessage>, RtmpError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let fmt = first >> 6;
        let (csid, mut offset) = match first & 0x3F {
            0 => {
                if src.len() < 2 {
                    return Ok(None);
                }
                (u32::from(src[1]) + 64, 2)
            }
            1 => {
                if src.len() < 3 {
                    return Ok(None);
                }
                (u32::from(src[2]) * 256 + u32::from(src[1]) + 64, 3)
            }
            id => (u32::from(id), 1),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if src.len() < offset + header_len {
            return Ok(None);
        }

        if !self.streams.contains_key(&csid) && self.streams.len() >= MAX_CHUNK_STREAMS {
            return Err(RtmpErrorValue::MessageTooLarge(MAX_CHUNK_STREAMS).into());
        }
        let previous = self.streams.get(&csid);
        let (prev_extended, prev_length, buffered) = match previous {
            Some(state) => (state.extended, state.length, state.payload.len()),
            None if fmt == 0 => (false, 0, 0),
            None => return Err(RtmpErrorValue::MissingPreviousHeader { fmt, csid }.into()),
        };

        let header = &src[offset..offset + header_len];
        let raw_ts = if fmt <= 2 {
            BigEndian::read_u24(&header[0..3])
        } else {
            0
        };
        let length = if fmt <= 1 {
            BigEndian::read_u24(&header[3..6]) as usize
        } else {
            prev_length
        };
        let type_id = (fmt <= 1).then(|| header[6]);
        let stream_id = (fmt == 0).then(|| LittleEndian::read_u32(&header[7..11]));
        offset += header_len;

        let extended = if fmt <= 2 {
            raw_ts == EXTENDED_TIMESTAMP
        } else {
            prev_extended
        };
        let mut timestamp_field = raw_ts;
        if extended {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            if fmt <= 2 {
                timestamp_field = BigEndian::read_u32(&src[offset..offset + 4]);
            }
            offset += 4;
        }

        if length > MAX_MESSAGE_SIZE {
            return Err(RtmpErrorValue::MessageTooLarge(length).into());
        }
        let chunk_len = length.saturating_sub(buffered).min(self.in_chunk_size);
        if src.len() < offset + chunk_len {
            return Ok(None);
        }

        // the chunk is complete; commit header state
        let state = self.streams.entry(csid).or_default();
        let starting = state.payload.is_empty();
        match fmt {
            0 => {
                state.timestamp = timestamp_field;
                state.delta = 0;
            }
            1 | 2 => {
                state.delta = timestamp_field;
                state.timestamp = state.timestamp.wrapping_add(timestamp_field);
            }
            _ => {
                if starting {
                    state.timestamp = state.timestamp.wrapping_add(state.delta);
                }
            }
        }
        state.length = length;
        if let Some(type_id) = type_id {
            state.type_id = type_id;
        }
        if let Some(stream_id) = stream_id {
            state.stream_id = stream_id;
        }
        state.extended = extended;

        src.advance(offset);
        state.payload.extend_from_slice(&src[..chunk_len]);
        src.advance(chunk_len);
        self.bytes_read += (offset + chunk_len) as u64;

        let message = if state.payload.len() >= state.length {
            let payload = std::mem::take(&mut state.payload).freeze();
            Some(RtmpMessage {
                csid,
                timestamp: state.timestamp,
                type_id: state.type_id,
                stream_id: state.stream_id,
                payload,
            })
        } else {
            None
        };

        if let Some(msg) = &message {
            if msg.type_id == msg_type::SET_CHUNK_SIZE && msg.payload.len() >= 4 {
                let size = (BigEndian::read_u32(&msg.payload[..4]) & 0x7FFF_FFFF) as usize;
                self.in_chunk_size = size.clamp(1, MAX_MESSAGE_SIZE);
            }
        }
        Ok(message)
    }
}

impl Decoder for ChunkCodec {
    type Item = RtmpMessage;
    type Error = RtmpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let before = src.len();
            match self.decode_chunk(src)? {
                Some(message) => return Ok(Some(message)),
                None if src.len() == before => return Ok(None),
                None => {}
            }
        }
    }
}

fn write_basic_header(dst: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => dst.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            dst.put_u8(fmt << 6);
            dst.put_u8((csid - 64) as u8);
        }
        _ => {
            let id = csid.saturating_sub(64).min(0xFFFF);
            dst.put_u8((fmt << 6) | 1);
            dst.put_u8((id & 0xFF) as u8);
            dst.put_u8((id >> 8) as u8);
        }
    }
}

impl Encoder<RtmpMessage> for ChunkCodec {
    type Error = RtmpError;

    fn encode(&mut self, msg: RtmpMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.payload.len() > MAX_MESSAGE_SIZE {
            return Err(RtmpErrorValue::MessageTooLarge(msg.payload.len()).into());
        }
        let extended = msg.timestamp >= EXTENDED_TIMESTAMP;
        let chunk_size = self.out_chunk_size;
        dst.reserve(msg.payload.len() + 18 + msg.payload.len() / chunk_size * 8);

        write_basic_header(dst, 0, msg.csid);
        let mut buf = [0u8; 3];
        BigEndian::write_u24(&mut buf, msg.timestamp.min(EXTENDED_TIMESTAMP));
        dst.put_slice(&buf);
        BigEndian::write_u24(&mut buf, msg.payload.len() as u32);
        dst.put_slice(&buf);
        dst.put_u8(msg.type_id);
        dst.put_u32_le(msg.stream_id);
        if extended {
            dst.put_u32(msg.timestamp);
        }

        for (index, chunk) in msg.payload.chunks(chunk_size).enumerate() {
            if index > 0 {
                write_basic_header(dst, 3, msg.csid);
                if extended {
                    dst.put_u32(msg.timestamp);
                }
            }
            dst.put_slice(chunk);
        }

        if msg.type_id == msg_type::SET_CHUNK_SIZE && msg.payload.len() >= 4 {
            let size = (BigEndian::read_u32(&msg.payload[..4]) & 0x7FFF_FFFF) as usize;
            self.out_chunk_size = size.clamp(1, MAX_MESSAGE_SIZE);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::rtmp::message::{csid, RtmpMessage},
        bytes::Bytes,
    };

    fn video(ts: u32, len: usize) -> RtmpMessage {
        RtmpMessage {
            csid: csid::VIDEO,
            timestamp: ts,
            type_id: msg_type::VIDEO,
            stream_id: 1,
            payload: Bytes::from(vec![0xAB; len]),
        }
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(video(40, 1000), &mut buf).unwrap();

        let mut decoder = ChunkCodec::new();
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.timestamp, 40);
        assert_eq!(msg.payload.len(), 1000);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_waits() {
        let mut codec = ChunkCodec::new();
        let mut full = BytesMut::new();
        codec.encode(video(1, 300), &mut full).unwrap();

        let mut decoder = ChunkCodec::new();
        let mut partial = full.split_to(150);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        let msg = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(msg.payload.len(), 300);
    }

    #[test]
    fn test_set_chunk_size_applies_to_following_chunks() {
        let mut encoder = ChunkCodec::new();
        let mut buf = BytesMut::new();
        encoder
            .encode(RtmpMessage::set_chunk_size(4096), &mut buf)
            .unwrap();
        encoder.encode(video(0, 3000), &mut buf).unwrap();
        assert_eq!(encoder.out_chunk_size(), 4096);

        let mut decoder = ChunkCodec::new();
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.type_id, msg_type::SET_CHUNK_SIZE);
        assert_eq!(decoder.in_chunk_size(), 4096);
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload.len(), 3000);
    }

    #[test]
    fn test_extended_timestamp() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(video(0x0100_0000, 400), &mut buf).unwrap();
        let mut decoder = ChunkCodec::new();
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.timestamp, 0x0100_0000);
        assert_eq!(msg.payload.len(), 400);
    }

    #[test]
    fn test_fmt1_delta_accumulates() {
        // fmt 0 at ts=100, then fmt 1 with delta 40 on the same chunk stream
        let mut buf = BytesMut::new();
        buf.put_u8(6);
        buf.put_slice(&[0, 0, 100, 0, 0, 2, msg_type::VIDEO]);
        buf.put_u32_le(1);
        buf.put_slice(&[1, 2]);
        buf.put_u8((1 << 6) | 6);
        buf.put_slice(&[0, 0, 40, 0, 0, 1, msg_type::VIDEO]);
        buf.put_u8(3);

        let mut decoder = ChunkCodec::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().timestamp, 100);
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.timestamp, 140);
        assert_eq!(second.stream_id, 1);
        assert_eq!(decoder.bytes_read(), 12 + 2 + 8 + 1);
    }

    #[test]
    fn test_continuation_without_header_rejected() {
        let mut buf = BytesMut::from(&[(3u8 << 6) | 9, 1, 2][..]);
        let mut decoder = ChunkCodec::new();
        assert!(decoder.decode(&mut buf).is_err());
    }
}
