use {
    super::{crc32, define::table_id, errors::MpegTsError},
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
    bytes::BytesMut,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Pmt {
    pub pid: u16,
    pub program_number: u16,
    pub version_number: u8, //5 bits
    pub pcr_pid: u16,       //13 bits
    pub streams: Vec<PmtStream>,
}

pub struct PmtMuxer {
    pub bytes_writer: BytesWriter,
}

impl Default for PmtMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl PmtMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_writer: BytesWriter::new(),
        }
    }

    pub fn write(&mut self, pmt: &Pmt) -> Result<BytesMut, MpegTsError> {
        /*table id*/
        self.bytes_writer.write_u8(table_id::PMT)?;

        let mut body = BytesWriter::new();
        /*program_number*/
        body.write_u16::<BigEndian>(pmt.program_number)?;
        /*version_number*/
        body.write_u8(0xC1 | (pmt.version_number << 1))?;
        /*section_number, last_section_number*/
        body.write_u16::<BigEndian>(0x00)?;
        /*PCR_PID*/
        body.write_u16::<BigEndian>(0xE000 | pmt.pcr_pid)?;
        /*program_info_length*/
        body.write_u16::<BigEndian>(0xF000)?;

        for stream in &pmt.streams {
            body.write_u8(stream.stream_type)?;
            body.write_u16::<BigEndian>(0xE000 | stream.pid)?;
            /*ES_info_length*/
            body.write_u16::<BigEndian>(0xF000)?;
        }

        /*section_length*/
        self.bytes_writer
            .write_u16::<BigEndian>(0xB000 | (body.len() as u16 + 4))?;
        self.bytes_writer.write(body.get_current_bytes())?;

        let crc32_value = crc32::gen_crc32(0xFFFF_FFFF, self.bytes_writer.get_current_bytes());
        self.bytes_writer.write_u32::<BigEndian>(crc32_value)?;

        Ok(self.bytes_writer.extract_current_bytes())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::mpegts::define::stream_type};

    #[test]
    fn test_pmt_video_audio() {
        let pmt = Pmt {
            pid: 0x1000,
            program_number: 1,
            version_number: 0,
            pcr_pid: 0x100,
            streams: vec![
                PmtStream {
                    stream_type: stream_type::H264,
                    pid: 0x100,
                },
                PmtStream {
                    stream_type: stream_type::AAC,
                    pid: 0x101,
                },
            ],
        };
        let data = PmtMuxer::new().write(&pmt).unwrap();
        // 3 header bytes + 9 fixed + 2 * 5 stream entries + 4 crc
        assert_eq!(data.len(), 3 + 9 + 10 + 4);
        assert_eq!(data[0], table_id::PMT);
        let section_length = (u16::from(data[1] & 0x0F) << 8) | u16::from(data[2]);
        assert_eq!(section_length as usize, data.len() - 3);
        assert_eq!(crc32::gen_crc32(0xFFFF_FFFF, &data), 0);
    }
}
