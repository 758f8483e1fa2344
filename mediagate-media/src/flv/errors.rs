use crate::{
    bytesio::bytes_errors::{BytesReadError, BytesWriteError},
    h264::errors::H264Error,
};

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct FlvMuxerError {
    pub value: MuxerErrorValue,
}

#[derive(Debug, thiserror::Error)]
pub enum MuxerErrorValue {
    #[error("bytes write error: {0}")]
    BytesWriteError(BytesWriteError),
    #[error("tag body of {0} bytes does not fit a 24-bit size")]
    TagTooLarge(usize),
}

impl From<BytesWriteError> for FlvMuxerError {
    fn from(error: BytesWriteError) -> Self {
        Self {
            value: MuxerErrorValue::BytesWriteError(error),
        }
    }
}

impl From<MuxerErrorValue> for FlvMuxerError {
    fn from(val: MuxerErrorValue) -> Self {
        Self { value: val }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct FlvDemuxerError {
    pub value: DemuxerErrorValue,
}

#[derive(Debug, thiserror::Error)]
pub enum DemuxerErrorValue {
    #[error("bytes read error: {0}")]
    BytesReadError(BytesReadError),
    #[error("h264 error: {0}")]
    H264Error(H264Error),
    #[error("invalid flv signature")]
    BadSignature,
    #[error("tag data size {0} exceeds limit")]
    TagTooLarge(usize),
    #[error("video frame before sequence header")]
    MissingSequenceHeader,
    #[error("unsupported video codec {0}")]
    UnsupportedVideoCodec(u8),
    #[error("unsupported sound format {0}")]
    UnsupportedSoundFormat(u8),
}

impl From<DemuxerErrorValue> for FlvDemuxerError {
    fn from(val: DemuxerErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<BytesReadError> for FlvDemuxerError {
    fn from(error: BytesReadError) -> Self {
        Self {
            value: DemuxerErrorValue::BytesReadError(error),
        }
    }
}

impl From<H264Error> for FlvDemuxerError {
    fn from(error: H264Error) -> Self {
        Self {
            value: DemuxerErrorValue::H264Error(error),
        }
    }
}
