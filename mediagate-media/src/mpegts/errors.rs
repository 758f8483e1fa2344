use crate::bytesio::bytes_errors::{BytesReadError, BytesWriteError};

#[derive(Debug, thiserror::Error)]
pub enum MpegTsErrorValue {
    #[error("bytes read error: {0}")]
    BytesReadError(#[source] BytesReadError),
    #[error("bytes write error: {0}")]
    BytesWriteError(#[source] BytesWriteError),
    #[error("lost sync byte at offset {0}")]
    LostSync(usize),
    #[error("stream type {0:#04x} cannot be muxed")]
    UnsupportedStreamType(u8),
    #[error("pid {0:#06x} is not part of the program")]
    StreamNotFound(u16),
    #[error("malformed pes header")]
    BadPesHeader,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct MpegTsError {
    pub value: MpegTsErrorValue,
}

impl From<MpegTsErrorValue> for MpegTsError {
    fn from(val: MpegTsErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<BytesReadError> for MpegTsError {
    fn from(error: BytesReadError) -> Self {
        Self {
            value: MpegTsErrorValue::BytesReadError(error),
        }
    }
}

impl From<BytesWriteError> for MpegTsError {
    fn from(error: BytesWriteError) -> Self {
        Self {
            value: MpegTsErrorValue::BytesWriteError(error),
        }
    }
}
