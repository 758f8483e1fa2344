use super::bits_errors::{BitError, BitErrorValue};

/// MSB-first bit reader over a borrowed buffer, with exp-golomb helpers for
/// H.264 parameter sets.
pub struct BitsReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitsReader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    pub fn read_bit(&mut self) -> Result<u8, BitError> {
        let byte = self
            .data
            .get(self.bit_pos / 8)
            .ok_or(BitErrorValue::CannotReadBit)?;
        let bit = (byte >> (7 - (self.bit_pos % 8))) & 0x01;
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn read_bool(&mut self) -> Result<bool, BitError> {
        Ok(self.read_bit()? == 1)
    }

    pub fn read_n_bits(&mut self, n: usize) -> Result<u32, BitError> {
        if n > 32 {
            return Err(BitErrorValue::TooBig.into());
        }
        let mut value: u32 = 0;
        for _ in 0..n {
            value = (value << 1) | u32::from(self.read_bit()?);
        }
        Ok(value)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), BitError> {
        if self.bit_pos + n > self.data.len() * 8 {
            return Err(BitErrorValue::CannotReadBit.into());
        }
        self.bit_pos += n;
        Ok(())
    }

    /// Unsigned exp-golomb, ue(v).
    pub fn read_ue(&mut self) -> Result<u32, BitError> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(BitErrorValue::BadExpGolomb.into());
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_n_bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + suffix)
    }

    /// Signed exp-golomb, se(v).
    pub fn read_se(&mut self) -> Result<i32, BitError> {
        let code = self.read_ue()?;
        let magnitude = code.div_ceil(2) as i32;
        Ok(if code % 2 == 1 { magnitude } else { -magnitude })
    }
}
