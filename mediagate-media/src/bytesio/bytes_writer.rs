use {
    super::bytes_errors::{BytesWriteError, BytesWriteErrorValue},
    byteorder::{ByteOrder, WriteBytesExt},
    bytes::BytesMut,
};

#[derive(Default)]
pub struct BytesWriter {
    bytes: Vec<u8>,
}

impl BytesWriter {
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<(), BytesWriteError> {
        self.bytes.write_u8(byte)?;
        Ok(())
    }

    pub fn write_u16<T: ByteOrder>(&mut self, bytes: u16) -> Result<(), BytesWriteError> {
        self.bytes.write_u16::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u24<T: ByteOrder>(&mut self, bytes: u32) -> Result<(), BytesWriteError> {
        self.bytes.write_u24::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u32<T: ByteOrder>(&mut self, bytes: u32) -> Result<(), BytesWriteError> {
        self.bytes.write_u32::<T>(bytes)?;
        Ok(())
    }

    pub fn write_u64<T: ByteOrder>(&mut self, bytes: u64) -> Result<(), BytesWriteError> {
        self.bytes.write_u64::<T>(bytes)?;
        Ok(())
    }

    pub fn write_f64<T: ByteOrder>(&mut self, bytes: f64) -> Result<(), BytesWriteError> {
        self.bytes.write_f64::<T>(bytes)?;
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<(), BytesWriteError> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }

    pub fn write_random_bytes(&mut self, length: u32) -> Result<(), BytesWriteError> {
        use rand::RngExt;
        let mut rng = rand::rng();
        for _ in 0..length {
            self.bytes.write_u8(rng.random())?;
        }
        Ok(())
    }

    /// Overwrites bytes already written, e.g. to patch a length field.
    pub fn overwrite(&mut self, position: usize, buf: &[u8]) -> Result<(), BytesWriteError> {
        let end = position + buf.len();
        let target = self
            .bytes
            .get_mut(position..end)
            .ok_or(BytesWriteErrorValue::OutofIndex)?;
        target.copy_from_slice(buf);
        Ok(())
    }

    #[must_use]
    pub fn get_current_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn extract_current_bytes(&mut self) -> BytesMut {
        BytesMut::from(&std::mem::take(&mut self.bytes)[..])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
