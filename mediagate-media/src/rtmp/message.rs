use {
    super::errors::RtmpError,
    crate::amf0::{self, Amf0Reader, Amf0Value},
    byteorder::{BigEndian, ByteOrder},
    bytes::{BufMut, Bytes, BytesMut},
};

pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF3: u8 = 15;
    pub const COMMAND_AMF3: u8 = 17;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

pub mod csid {
    pub const PROTOCOL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const DATA: u32 = 5;
    pub const VIDEO: u32 = 6;
}

pub mod user_control {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const SET_BUFFER_LENGTH: u16 = 3;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub csid: u32,
    pub timestamp: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// An AMF0 command decoded from a command message.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub object: Amf0Value,
    pub args: Vec<Amf0Value>,
}

impl Command {
    /// First string argument, e.g. the stream name of `publish`/`play`.
    #[must_use]
    pub fn first_string_arg(&self) -> Option<&str> {
        self.args.first().and_then(Amf0Value::as_str)
    }
}

fn control(type_id: u8, payload: Bytes) -> RtmpMessage {
    RtmpMessage {
        csid: csid::PROTOCOL,
        timestamp: 0,
        type_id,
        stream_id: 0,
        payload,
    }
}

impl RtmpMessage {
    #[must_use]
    pub fn set_chunk_size(size: u32) -> Self {
        control(
            msg_type::SET_CHUNK_SIZE,
            Bytes::copy_from_slice(&(size & 0x7FFF_FFFF).to_be_bytes()),
        )
    }

    #[must_use]
    pub fn window_ack_size(size: u32) -> Self {
        control(msg_type::WINDOW_ACK_SIZE, Bytes::copy_from_slice(&size.to_be_bytes()))
    }

    #[must_use]
    pub fn acknowledgement(sequence: u32) -> Self {
        control(msg_type::ACKNOWLEDGEMENT, Bytes::copy_from_slice(&sequence.to_be_bytes()))
    }

    #[must_use]
    pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Self {
        let mut payload = BytesMut::with_capacity(5);
        payload.put_u32(size);
        payload.put_u8(limit_type);
        control(msg_type::SET_PEER_BANDWIDTH, payload.freeze())
    }

    #[must_use]
    pub fn user_control(event: u16, data: &[u32]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + data.len() * 4);
        payload.put_u16(event);
        for value in data {
            payload.put_u32(*value);
        }
        control(msg_type::USER_CONTROL, payload.freeze())
    }

    pub fn command(
        stream_id: u32,
        name: &str,
        transaction_id: f64,
        object: Amf0Value,
        args: Vec<Amf0Value>,
    ) -> Result<Self, RtmpError> {
        let mut values = vec![Amf0Value::from(name), Amf0Value::Number(transaction_id), object];
        values.extend(args);
        Ok(Self {
            csid: csid::COMMAND,
            timestamp: 0,
            type_id: msg_type::COMMAND_AMF0,
            stream_id,
            payload: amf0::encode(&values)?.freeze(),
        })
    }

    pub fn data(stream_id: u32, values: &[Amf0Value]) -> Result<Self, RtmpError> {
        Ok(Self {
            csid: csid::DATA,
            timestamp: 0,
            type_id: msg_type::DATA_AMF0,
            stream_id,
            payload: amf0::encode(values)?.freeze(),
        })
    }

    #[must_use]
    pub fn audio(stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            csid: csid::AUDIO,
            timestamp,
            type_id: msg_type::AUDIO,
            stream_id,
            payload,
        }
    }

    #[must_use]
    pub fn video(stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            csid: csid::VIDEO,
            timestamp,
            type_id: msg_type::VIDEO,
            stream_id,
            payload,
        }
    }

    /// Decodes an AMF0 command (or an AMF3 command, which carries a leading
    /// format byte before plain AMF0 values).
    pub fn parse_command(&self) -> Result<Option<Command>, RtmpError> {
        let body = match self.type_id {
            msg_type::COMMAND_AMF0 => &self.payload[..],
            msg_type::COMMAND_AMF3 if !self.payload.is_empty() => &self.payload[1..],
            _ => return Ok(None),
        };
        let mut values = Amf0Reader::new(BytesMut::from(body)).read_all()?.into_iter();
        let Some(Amf0Value::String(name)) = values.next() else {
            return Ok(None);
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let object = values.next().unwrap_or(Amf0Value::Null);
        Ok(Some(Command {
            name,
            transaction_id,
            object,
            args: values.collect(),
        }))
    }

    pub fn parse_data(&self) -> Result<Vec<Amf0Value>, RtmpError> {
        let body = match self.type_id {
            msg_type::DATA_AMF3 if !self.payload.is_empty() => &self.payload[1..],
            _ => &self.payload[..],
        };
        Ok(Amf0Reader::new(BytesMut::from(body)).read_all()?)
    }

    /// The u32 carried by SetChunkSize, WindowAckSize and Acknowledgement.
    #[must_use]
    pub fn control_value(&self) -> Option<u32> {
        (self.payload.len() >= 4).then(|| BigEndian::read_u32(&self.payload[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let msg = RtmpMessage::command(
            0,
            "connect",
            1.0,
            Amf0Value::object([("app", "live".into())]),
            vec![],
        )
        .unwrap();
        let cmd = msg.parse_command().unwrap().unwrap();
        assert_eq!(cmd.name, "connect");
        assert_eq!(cmd.transaction_id, 1.0);
        assert_eq!(cmd.object.get("app").and_then(Amf0Value::as_str), Some("live"));
    }

    #[test]
    fn test_play_args() {
        let msg = RtmpMessage::command(1, "play", 4.0, Amf0Value::Null, vec!["cam1".into()])
            .unwrap();
        let cmd = msg.parse_command().unwrap().unwrap();
        assert_eq!(cmd.first_string_arg(), Some("cam1"));
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(RtmpMessage::set_chunk_size(4096).control_value(), Some(4096));
        let ping = RtmpMessage::user_control(user_control::PING_REQUEST, &[7]);
        assert_eq!(&ping.payload[..], &[0, 6, 0, 0, 0, 7]);
        assert!(RtmpMessage::video(1, 0, Bytes::new()).parse_command().unwrap().is_none());
    }
}
