// mediagate-media: protocol and container codecs
//
// Everything here is pure framing: parsing and writing bytes for the wire
// formats the gateway speaks. No stream policy, no registry, no tasks beyond
// the per-connection RTMP helpers.
//
// Ingest side:  rtsp + rtp (H.264/AAC), rtmp (chunk/amf0/flv tags), ps (GB28181)
// Output side:  flv, mpegts, fmp4, hls playlist, rtp packetizer, rtmp, rtsp

pub mod aac;
pub mod amf0;
pub mod bytesio;
pub mod flv;
pub mod fmp4;
pub mod h264;
pub mod hls;
pub mod mpegts;
pub mod ps;
pub mod rtmp;
pub mod rtp;
pub mod rtsp;
