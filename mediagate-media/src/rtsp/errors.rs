use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RtspErrorValue {
    #[error("io error: {0}")]
    IO(#[source] io::Error),
    #[error("malformed start line: {0}")]
    BadStartLine(String),
    #[error("malformed header line: {0}")]
    BadHeader(String),
    #[error("invalid content length: {0}")]
    BadContentLength(String),
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("invalid utf-8 in message head")]
    Utf8,
    #[error("invalid sdp: {0}")]
    BadSdp(String),
    #[error("{method} failed: {status} {reason}")]
    BadStatus {
        method: String,
        status: u16,
        reason: String,
    },
    #[error("authentication rejected")]
    Unauthorized,
    #[error("unsupported authentication scheme: {0}")]
    UnsupportedAuth(String),
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid rtsp url: {0}")]
    BadUrl(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct RtspError {
    pub value: RtspErrorValue,
}

impl From<RtspErrorValue> for RtspError {
    fn from(val: RtspErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<io::Error> for RtspError {
    fn from(error: io::Error) -> Self {
        Self {
            value: RtspErrorValue::IO(error),
        }
    }
}
