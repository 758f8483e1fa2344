pub mod define;
pub mod demuxer;
pub mod errors;
pub mod muxer;
