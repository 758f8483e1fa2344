pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
pub const PCR_INTERVAL_MS: i64 = 40;

pub mod pid {
    pub const PAT: u16 = 0x0000;
    pub const PMT: u16 = 0x1000;
    pub const VIDEO: u16 = 0x0100;
    pub const AUDIO: u16 = 0x0101;
}

pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
}

pub mod stream_type {
    pub const AAC: u8 = 0x0F;
    pub const H264: u8 = 0x1B;
    pub const H265: u8 = 0x24;
    /// G.711 has no assigned type; the values below follow common practice
    /// (also used by GB28181 program streams).
    pub const G711A: u8 = 0x90;
    pub const G711U: u8 = 0x91;

    #[must_use]
    pub const fn is_video(stream_type: u8) -> bool {
        matches!(stream_type, H264 | H265)
    }
}

pub mod stream_id {
    pub const VIDEO: u8 = 0xE0;
    pub const AUDIO: u8 = 0xC0;
}
