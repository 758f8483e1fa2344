use {
    super::bytes_errors::{BytesReadError, BytesReadErrorValue},
    byteorder::{ByteOrder, ReadBytesExt},
    bytes::{Buf, BytesMut},
    std::io::Cursor,
};

/// Consuming reader over an owned buffer. Reads that run past the end fail
/// with `NotEnoughBytes` and leave the buffer untouched.
pub struct BytesReader {
    buffer: BytesMut,
}

impl BytesReader {
    #[must_use]
    pub const fn new(input: BytesMut) -> Self {
        Self { buffer: input }
    }

    pub fn extend_from_slice(&mut self, extend: &[u8]) {
        self.buffer.extend_from_slice(extend);
    }

    fn ensure(&self, need: usize) -> Result<(), BytesReadError> {
        if self.buffer.len() < need {
            return Err(BytesReadError::not_enough(need, self.buffer.len()));
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, bytes_num: usize) -> Result<BytesMut, BytesReadError> {
        self.ensure(bytes_num)?;
        Ok(self.buffer.split_to(bytes_num))
    }

    pub fn advance_bytes(&mut self, bytes_num: usize) -> Result<(), BytesReadError> {
        self.ensure(bytes_num)?;
        self.buffer.advance(bytes_num);
        Ok(())
    }

    pub fn read_bytes_cursor(&mut self, bytes_num: usize) -> Result<Cursor<BytesMut>, BytesReadError> {
        let tmp_bytes = self.read_bytes(bytes_num)?;
        Ok(Cursor::new(tmp_bytes))
    }

    pub fn read_u8(&mut self) -> Result<u8, BytesReadError> {
        self.ensure(1)?;
        Ok(self.buffer.get_u8())
    }

    pub fn peek_u8(&self) -> Result<u8, BytesReadError> {
        self.buffer
            .first()
            .copied()
            .ok_or_else(|| BytesReadError::not_enough(1, 0))
    }

    pub fn get(&self, index: usize) -> Result<u8, BytesReadError> {
        self.buffer
            .get(index)
            .copied()
            .ok_or_else(|| BytesReadErrorValue::IndexOutofRange.into())
    }

    pub fn read_u16<T: ByteOrder>(&mut self) -> Result<u16, BytesReadError> {
        Ok(self.read_bytes_cursor(2)?.read_u16::<T>()?)
    }

    pub fn read_u24<T: ByteOrder>(&mut self) -> Result<u32, BytesReadError> {
        Ok(self.read_bytes_cursor(3)?.read_u24::<T>()?)
    }

    pub fn read_u32<T: ByteOrder>(&mut self) -> Result<u32, BytesReadError> {
        Ok(self.read_bytes_cursor(4)?.read_u32::<T>()?)
    }

    pub fn read_u64<T: ByteOrder>(&mut self) -> Result<u64, BytesReadError> {
        Ok(self.read_bytes_cursor(8)?.read_u64::<T>()?)
    }

    pub fn read_f64<T: ByteOrder>(&mut self) -> Result<f64, BytesReadError> {
        Ok(self.read_bytes_cursor(8)?.read_f64::<T>()?)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn get_remaining_bytes(&self) -> BytesMut {
        self.buffer.clone()
    }

    pub fn extract_remaining_bytes(&mut self) -> BytesMut {
        self.buffer.split_to(self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian;

    #[test]
    fn test_read_integers() {
        let mut reader = BytesReader::new(BytesMut::from(
            &[0x01, 0x00, 0x02, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04][..],
        ));
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u16::<BigEndian>().unwrap(), 2);
        assert_eq!(reader.read_u24::<BigEndian>().unwrap(), 3);
        assert_eq!(reader.read_u32::<BigEndian>().unwrap(), 4);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_read_keeps_buffer() {
        let mut reader = BytesReader::new(BytesMut::from(&[0x01, 0x02][..]));
        let err = reader.read_u32::<BigEndian>().unwrap_err();
        assert!(err.is_incomplete());
        assert_eq!(reader.len(), 2);
    }
}
