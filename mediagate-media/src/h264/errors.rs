use crate::bytesio::{bits_errors::BitError, bytes_errors::BytesReadError};

#[derive(Debug, thiserror::Error)]
pub enum H264ErrorValue {
    #[error("bit error: {0}")]
    BitError(BitError),
    #[error("bytes read error: {0}")]
    BytesReadError(BytesReadError),
    #[error("avc decoder configuration record version {0} is not supported")]
    UnsupportedConfigVersion(u8),
    #[error("nal unit length {length} exceeds remaining {remaining} bytes")]
    BadNaluLength { length: usize, remaining: usize },
    #[error("empty sps")]
    EmptySps,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct H264Error {
    pub value: H264ErrorValue,
}

impl From<H264ErrorValue> for H264Error {
    fn from(val: H264ErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<BitError> for H264Error {
    fn from(error: BitError) -> Self {
        Self {
            value: H264ErrorValue::BitError(error),
        }
    }
}

impl From<BytesReadError> for H264Error {
    fn from(error: BytesReadError) -> Self {
        Self {
            value: H264ErrorValue::BytesReadError(error),
        }
    }
}
