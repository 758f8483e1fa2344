//! RTMP: simple handshake, chunk stream codec, command helpers and a
//! connection wrapper that drives the server (publish/play) and client
//! (pull) flows.

pub mod chunk;
pub mod connection;
pub mod errors;
pub mod handshake;
pub mod message;
pub mod address;
