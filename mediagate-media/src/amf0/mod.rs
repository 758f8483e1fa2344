//! AMF0 encoding, as used by RTMP command and data messages.

pub mod errors;

use {
    crate::bytesio::{bytes_reader::BytesReader, bytes_writer::BytesWriter},
    byteorder::BigEndian,
    bytes::BytesMut,
    errors::{Amf0ReadError, Amf0ReadErrorValue, Amf0WriteError, Amf0WriteErrorValue},
    indexmap::IndexMap,
};

pub mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const STRICT_ARRAY: u8 = 0x0A;
    pub const LONG_STRING: u8 = 0x0C;
}

const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(IndexMap<String, Amf0Value>),
    Null,
    Undefined,
    EcmaArray(IndexMap<String, Amf0Value>),
    StrictArray(Vec<Amf0Value>),
}

impl Amf0Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup on objects and ECMA arrays.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(map) | Self::EcmaArray(map) => map.get(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn object<const N: usize>(entries: [(&str, Self); N]) -> Self {
        Self::Object(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

impl From<&str> for Amf0Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<f64> for Amf0Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

pub struct Amf0Reader {
    reader: BytesReader,
}

impl Amf0Reader {
    #[must_use]
    pub const fn new(data: BytesMut) -> Self {
        Self {
            reader: BytesReader::new(data),
        }
    }

    pub fn read_all(&mut self) -> Result<Vec<Amf0Value>, Amf0ReadError> {
        let mut values = Vec::new();
        while !self.reader.is_empty() {
            values.push(self.read_any(0)?);
        }
        Ok(values)
    }

    fn read_any(&mut self, depth: usize) -> Result<Amf0Value, Amf0ReadError> {
        if depth > MAX_DEPTH {
            return Err(Amf0ReadErrorValue::TooDeep(MAX_DEPTH).into());
        }
        let marker = self.reader.read_u8()?;
        match marker {
            marker::NUMBER => Ok(Amf0Value::Number(self.reader.read_f64::<BigEndian>()?)),
            marker::BOOLEAN => Ok(Amf0Value::Boolean(self.reader.read_u8()? != 0)),
            marker::STRING => Ok(Amf0Value::String(self.read_short_string()?)),
            marker::LONG_STRING => {
                let len = self.reader.read_u32::<BigEndian>()? as usize;
                let bytes = self.reader.read_bytes(len)?;
                Ok(Amf0Value::String(String::from_utf8(bytes.to_vec())?))
            }
            marker::OBJECT => Ok(Amf0Value::Object(self.read_properties(depth)?)),
            marker::ECMA_ARRAY => {
                // the count is advisory; properties end with the object end marker
                self.reader.read_u32::<BigEndian>()?;
                Ok(Amf0Value::EcmaArray(self.read_properties(depth)?))
            }
            marker::STRICT_ARRAY => {
                let count = self.reader.read_u32::<BigEndian>()?;
                let mut values = Vec::new();
                for _ in 0..count {
                    values.push(self.read_any(depth + 1)?);
                }
                Ok(Amf0Value::StrictArray(values))
            }
            marker::NULL => Ok(Amf0Value::Null),
            marker::UNDEFINED => Ok(Amf0Value::Undefined),
            other => Err(Amf0ReadErrorValue::UnknownMarker { marker: other }.into()),
        }
    }

    fn read_short_string(&mut self) -> Result<String, Amf0ReadError> {
        let len = self.reader.read_u16::<BigEndian>()? as usize;
        let bytes = self.reader.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn read_properties(&mut self, depth: usize) -> Result<IndexMap<String, Amf0Value>, Amf0ReadError> {
        let mut properties = IndexMap::new();
        loop {
            let key = self.read_short_string()?;
            if key.is_empty() && self.reader.peek_u8()? == marker::OBJECT_END {
                self.reader.read_u8()?;
                break;
            }
            let value = self.read_any(depth + 1)?;
            properties.insert(key, value);
        }
        Ok(properties)
    }
}

#[derive(Default)]
pub struct Amf0Writer {
    writer: BytesWriter,
}

impl Amf0Writer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: BytesWriter::new(),
        }
    }

    pub fn write_any(&mut self, value: &Amf0Value) -> Result<(), Amf0WriteError> {
        match value {
            Amf0Value::Number(n) => {
                self.writer.write_u8(marker::NUMBER)?;
                self.writer.write_f64::<BigEndian>(*n)?;
            }
            Amf0Value::Boolean(b) => {
                self.writer.write_u8(marker::BOOLEAN)?;
                self.writer.write_u8(u8::from(*b))?;
            }
            Amf0Value::String(s) => {
                if s.len() > usize::from(u16::MAX) {
                    self.writer.write_u8(marker::LONG_STRING)?;
                    self.writer.write_u32::<BigEndian>(s.len() as u32)?;
                    self.writer.write(s.as_bytes())?;
                } else {
                    self.writer.write_u8(marker::STRING)?;
                    self.write_short_string(s)?;
                }
            }
            Amf0Value::Object(map) => {
                self.writer.write_u8(marker::OBJECT)?;
                self.write_properties(map)?;
            }
            Amf0Value::EcmaArray(map) => {
                self.writer.write_u8(marker::ECMA_ARRAY)?;
                self.writer.write_u32::<BigEndian>(map.len() as u32)?;
                self.write_properties(map)?;
            }
            Amf0Value::StrictArray(values) => {
                self.writer.write_u8(marker::STRICT_ARRAY)?;
                self.writer.write_u32::<BigEndian>(values.len() as u32)?;
                for value in values {
                    self.write_any(value)?;
                }
            }
            Amf0Value::Null => self.writer.write_u8(marker::NULL)?,
            Amf0Value::Undefined => self.writer.write_u8(marker::UNDEFINED)?,
        }
        Ok(())
    }

    pub fn write_all(&mut self, values: &[Amf0Value]) -> Result<(), Amf0WriteError> {
        for value in values {
            self.write_any(value)?;
        }
        Ok(())
    }

    fn write_short_string(&mut self, s: &str) -> Result<(), Amf0WriteError> {
        if s.len() > usize::from(u16::MAX) {
            return Err(Amf0WriteErrorValue::NormalStringTooLong.into());
        }
        self.writer.write_u16::<BigEndian>(s.len() as u16)?;
        self.writer.write(s.as_bytes())?;
        Ok(())
    }

    fn write_properties(&mut self, map: &IndexMap<String, Amf0Value>) -> Result<(), Amf0WriteError> {
        for (key, value) in map {
            self.write_short_string(key)?;
            self.write_any(value)?;
        }
        self.writer.write_u16::<BigEndian>(0)?;
        self.writer.write_u8(marker::OBJECT_END)?;
        Ok(())
    }

    pub fn extract(&mut self) -> BytesMut {
        self.writer.extract_current_bytes()
    }
}

/// Encodes a command/data message body.
pub fn encode(values: &[Amf0Value]) -> Result<BytesMut, Amf0WriteError> {
    let mut writer = Amf0Writer::new();
    writer.write_all(values)?;
    Ok(writer.extract())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_roundtrip() {
        let values = vec![
            Amf0Value::from("connect"),
            Amf0Value::Number(1.0),
            Amf0Value::object([
                ("app", Amf0Value::from("live")),
                ("tcUrl", Amf0Value::from("rtmp://localhost/live")),
                ("fpad", Amf0Value::Boolean(false)),
            ]),
            Amf0Value::Null,
        ];
        let bytes = encode(&values).unwrap();
        let decoded = Amf0Reader::new(bytes).read_all().unwrap();
        assert_eq!(decoded, values);
        assert_eq!(decoded[2].get("app").and_then(Amf0Value::as_str), Some("live"));
    }

    #[test]
    fn test_ecma_array_and_strict_array() {
        let mut map = IndexMap::new();
        map.insert("width".to_string(), Amf0Value::Number(1280.0));
        let values = vec![
            Amf0Value::EcmaArray(map),
            Amf0Value::StrictArray(vec![Amf0Value::Undefined, Amf0Value::Boolean(true)]),
        ];
        let decoded = Amf0Reader::new(encode(&values).unwrap()).read_all().unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_unknown_marker() {
        let mut reader = Amf0Reader::new(BytesMut::from(&[0x42u8][..]));
        assert!(reader.read_all().is_err());
    }
}
