use {
    super::{crc32, define::table_id, errors::MpegTsError},
    crate::bytesio::bytes_writer::BytesWriter,
    byteorder::BigEndian,
    bytes::BytesMut,
};

#[derive(Debug, Clone)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version_number: u8, //5 bits
    /// (program_number, pmt pid)
    pub programs: Vec<(u16, u16)>,
}

impl Default for Pat {
    fn default() -> Self {
        Self::new()
    }
}

impl Pat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transport_stream_id: 1,
            version_number: 0,
            programs: Vec::new(),
        }
    }
}

pub struct PatMuxer {
    pub bytes_writer: BytesWriter,
}

impl Default for PatMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl PatMuxer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_writer: BytesWriter::new(),
        }
    }

    /// Writes the PAT section (without pointer field).
    pub fn write(&mut self, pat: &Pat) -> Result<BytesMut, MpegTsError> {
        /*table id*/
        self.bytes_writer.write_u8(table_id::PAT)?;
        /*section length*/
        let length = pat.programs.len() as u16 * 4 + 5 + 4;
        self.bytes_writer.write_u16::<BigEndian>(0xB000 | length)?;
        /*transport_stream_id*/
        self.bytes_writer
            .write_u16::<BigEndian>(pat.transport_stream_id)?;
        /*version_number, current_next_indicator*/
        self.bytes_writer
            .write_u8(0xC1 | (pat.version_number << 1))?;
        /*section_number, last_section_number*/
        self.bytes_writer.write_u16::<BigEndian>(0x00)?;

        for (program_number, pid) in &pat.programs {
            self.bytes_writer.write_u16::<BigEndian>(*program_number)?;
            self.bytes_writer.write_u16::<BigEndian>(0xE000 | pid)?;
        }

        let crc32_value = crc32::gen_crc32(0xFFFF_FFFF, self.bytes_writer.get_current_bytes());
        self.bytes_writer.write_u32::<BigEndian>(crc32_value)?;

        Ok(self.bytes_writer.extract_current_bytes())
    }
}
