use mediagate_media::{
    flv::errors::{FlvDemuxerError, FlvMuxerError},
    fmp4::errors::Fmp4Error,
    h264::errors::H264Error,
    mpegts::errors::MpegTsError,
    ps::errors::PsError,
    rtmp::errors::RtmpError,
    rtp::errors::RtpError,
    rtsp::errors::{RtspError, RtspErrorValue},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Network failure on an ingest or output path; retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed handshake or media unit; the unit is dropped and counted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A consumer fell behind its queue and was detached.
    #[error("Consumer overrun: {0}")]
    Overrun(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialisable error class surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Overrun,
    Storage,
    NotFound,
    Busy,
    Unsupported,
    InvalidInput,
    Config,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Overrun => "overrun",
            Self::Storage => "storage",
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::Unsupported => "unsupported",
            Self::InvalidInput => "invalid_input",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl GatewayError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Overrun(_) => ErrorKind::Overrun,
            Self::Storage(_) => ErrorKind::Storage,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transport errors end the current connection and trigger a reconnect;
    /// everything else is handled where it happens.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<RtmpError> for GatewayError {
    fn from(err: RtmpError) -> Self {
        if err.is_transport() {
            Self::Transport(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

impl From<RtspError> for GatewayError {
    fn from(err: RtspError) -> Self {
        match err.value {
            RtspErrorValue::IO(_) | RtspErrorValue::Closed => Self::Transport(err.to_string()),
            // a rejected request ends the session the same way a dropped socket does
            RtspErrorValue::BadStatus { .. } | RtspErrorValue::Unauthorized => {
                Self::Transport(err.to_string())
            }
            _ => Self::Protocol(err.to_string()),
        }
    }
}

impl From<RtpError> for GatewayError {
    fn from(err: RtpError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<PsError> for GatewayError {
    fn from(err: PsError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<H264Error> for GatewayError {
    fn from(err: H264Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<FlvDemuxerError> for GatewayError {
    fn from(err: FlvDemuxerError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<FlvMuxerError> for GatewayError {
    fn from(err: FlvMuxerError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<MpegTsError> for GatewayError {
    fn from(err: MpegTsError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<Fmp4Error> for GatewayError {
    fn from(err: Fmp4Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<webrtc::Error> for GatewayError {
    fn from(err: webrtc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediagate_media::rtmp::errors::RtmpErrorValue;

    #[test]
    fn test_kind_strings() {
        assert_eq!(GatewayError::Busy("x".into()).kind().as_str(), "busy");
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotFound).unwrap(),
            "\"not_found\""
        );
    }

    #[test]
    fn test_codec_error_classification() {
        let closed: GatewayError = RtmpError::from(RtmpErrorValue::Closed).into();
        assert!(closed.is_transport());
        let bad: GatewayError = RtmpError::from(RtmpErrorValue::BadVersion(9)).into();
        assert_eq!(bad.kind(), ErrorKind::Protocol);
        let sdp: GatewayError = RtspError::from(RtspErrorValue::BadSdp("m=".into())).into();
        assert_eq!(sdp.kind(), ErrorKind::Protocol);
    }
}
