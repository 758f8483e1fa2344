//! RTSP 1.0 messages over TCP (with `$`-interleaved RTP), SDP and
//! Basic/Digest authentication.

pub mod auth;
pub mod errors;
pub mod message;
pub mod sdp;

pub const RTSP_VERSION: &str = "RTSP/1.0";
pub const DEFAULT_PORT: u16 = 554;
