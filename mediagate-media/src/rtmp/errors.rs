use {
    crate::{
        amf0::errors::{Amf0ReadError, Amf0WriteError},
        bytesio::bytes_errors::BytesWriteError,
    },
    std::io,
};

#[derive(Debug, thiserror::Error)]
pub enum RtmpErrorValue {
    #[error("io error: {0}")]
    IO(#[source] io::Error),
    #[error("bytes write error: {0}")]
    BytesWrite(#[source] BytesWriteError),
    #[error("handshake: unsupported version {0}")]
    BadVersion(u8),
    #[error("chunk message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),
    #[error("chunk fmt {fmt} on chunk stream {csid} without a previous header")]
    MissingPreviousHeader { fmt: u8, csid: u32 },
    #[error("amf0 read error: {0}")]
    Amf0Read(#[source] Amf0ReadError),
    #[error("amf0 write error: {0}")]
    Amf0Write(#[source] Amf0WriteError),
    #[error("unexpected command: {0}")]
    UnexpectedCommand(String),
    #[error("peer rejected {command}: {code}")]
    Rejected { command: String, code: String },
    #[error("missing app name")]
    NoAppName,
    #[error("missing stream name")]
    NoStreamName,
    #[error("invalid rtmp url: {0}")]
    BadUrl(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct RtmpError {
    pub value: RtmpErrorValue,
}

impl RtmpError {
    /// Errors caused by the transport rather than by what the peer sent.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self.value,
            RtmpErrorValue::IO(_) | RtmpErrorValue::Closed | RtmpErrorValue::Timeout(_)
        )
    }
}

impl From<RtmpErrorValue> for RtmpError {
    fn from(val: RtmpErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<io::Error> for RtmpError {
    fn from(error: io::Error) -> Self {
        Self {
            value: RtmpErrorValue::IO(error),
        }
    }
}

impl From<Amf0ReadError> for RtmpError {
    fn from(error: Amf0ReadError) -> Self {
        Self {
            value: RtmpErrorValue::Amf0Read(error),
        }
    }
}

impl From<Amf0WriteError> for RtmpError {
    fn from(error: Amf0WriteError) -> Self {
        Self {
            value: RtmpErrorValue::Amf0Write(error),
        }
    }
}

impl From<BytesWriteError> for RtmpError {
    fn from(error: BytesWriteError) -> Self {
        Self {
            value: RtmpErrorValue::BytesWrite(error),
        }
    }
}
