pub const FLV_HEADER_SIZE: usize = 9;
pub const FLV_PREV_TAG_SIZE_LEN: usize = 4;
pub const FLV_TAG_HEADER_SIZE: usize = 11;
/// Tags larger than this are treated as stream corruption.
pub const MAX_FLV_TAG_SIZE: usize = 10 * 1024 * 1024;

pub mod tag_type {
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const SCRIPT_DATA: u8 = 18;
}

pub mod frame_type {
    pub const KEY_FRAME: u8 = 1;
    pub const INTER_FRAME: u8 = 2;
}

pub mod codec_id {
    pub const AVC: u8 = 7;
    pub const HEVC: u8 = 12;
}

pub mod avc_packet_type {
    pub const AVC_SEQHDR: u8 = 0;
    pub const AVC_NALU: u8 = 1;
    pub const AVC_EOS: u8 = 2;
}

pub mod sound_format {
    pub const G711A: u8 = 7;
    pub const G711U: u8 = 8;
    pub const AAC: u8 = 10;
}

pub mod aac_packet_type {
    pub const AAC_SEQHDR: u8 = 0;
    pub const AAC_RAW: u8 = 1;
}
