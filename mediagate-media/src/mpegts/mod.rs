//! MPEG-2 transport stream (ITU-T H.222.0): PSI tables, PES packetization,
//! a muxer for HLS segments / HTTP-TS / recordings and a small demuxer used
//! to inspect existing files.

pub mod crc32;
pub mod define;
pub mod demuxer;
pub mod errors;
pub mod muxer;
pub mod pat;
pub mod pes;
pub mod pmt;
