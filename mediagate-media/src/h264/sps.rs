use {
    super::{errors::H264Error, unescape_rbsp},
    crate::bytesio::bits_reader::BitsReader,
};

/// The subset of the sequence parameter set needed to describe a track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

fn skip_scaling_list(reader: &mut BitsReader<'_>, size: usize) -> Result<(), H264Error> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Parses an SPS NAL unit (header byte included).
pub fn parse_sps(nalu: &[u8]) -> Result<SpsInfo, H264Error> {
    let rbsp = unescape_rbsp(nalu);
    let mut reader = BitsReader::new(&rbsp);

    reader.skip(8)?; // nal header
    let profile_idc = reader.read_n_bits(8)? as u8;
    reader.skip(8)?; // constraint flags
    let level_idc = reader.read_n_bits(8)? as u8;
    reader.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
        chroma_format_idc = reader.read_ue()?;
        if chroma_format_idc == 3 {
            reader.skip(1)?; // separate_colour_plane_flag
        }
        reader.read_ue()?; // bit_depth_luma_minus8
        reader.read_ue()?; // bit_depth_chroma_minus8
        reader.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if reader.read_bool()? {
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if reader.read_bool()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    reader.read_ue()?; // log2_max_frame_num_minus4
    match reader.read_ue()? {
        0 => {
            reader.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            reader.skip(1)?;
            reader.read_se()?;
            reader.read_se()?;
            let cycle = reader.read_ue()?;
            for _ in 0..cycle {
                reader.read_se()?;
            }
        }
        _ => {}
    }
    reader.read_ue()?; // max_num_ref_frames
    reader.skip(1)?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs_minus1 = reader.read_ue()?;
    let pic_height_in_map_units_minus1 = reader.read_ue()?;
    let frame_mbs_only_flag = reader.read_bit()?;
    if frame_mbs_only_flag == 0 {
        reader.skip(1)?; // mb_adaptive_frame_field_flag
    }
    reader.skip(1)?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if reader.read_bool()? {
        crop_left = reader.read_ue()?;
        crop_right = reader.read_ue()?;
        crop_top = reader.read_ue()?;
        crop_bottom = reader.read_ue()?;
    }

    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, 2 - u32::from(frame_mbs_only_flag)),
        1 => (2, 2 * (2 - u32::from(frame_mbs_only_flag))),
        2 => (2, 2 - u32::from(frame_mbs_only_flag)),
        _ => (1, 2 - u32::from(frame_mbs_only_flag)),
    };

    let width = (pic_width_in_mbs_minus1 + 1) * 16;
    let height = (2 - u32::from(frame_mbs_only_flag)) * (pic_height_in_map_units_minus1 + 1) * 16;

    Ok(SpsInfo {
        profile_idc,
        level_idc,
        width: width.saturating_sub((crop_left + crop_right) * crop_unit_x),
        height: height.saturating_sub((crop_top + crop_bottom) * crop_unit_y),
    })
}
