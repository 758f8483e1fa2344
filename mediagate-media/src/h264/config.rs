use {
    super::{
        errors::{H264Error, H264ErrorValue},
        extract_parameter_sets, to_annexb,
    },
    crate::bytesio::{bytes_reader::BytesReader, bytes_writer::BytesWriter, bytes_errors::BytesWriteError},
    byteorder::BigEndian,
    bytes::{Bytes, BytesMut},
};

/// AVCDecoderConfigurationRecord (ISO/IEC 14496-15 5.2.4.1), the `avcC`
/// payload used by FLV sequence headers and MP4 sample entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvcDecoderConfigurationRecord {
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub length_size_minus_one: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfigurationRecord {
    /// Builds a record from a single SPS/PPS pair.
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self, H264Error> {
        if sps.len() < 4 {
            return Err(H264ErrorValue::EmptySps.into());
        }
        Ok(Self {
            profile_indication: sps[1],
            profile_compatibility: sps[2],
            level_indication: sps[3],
            length_size_minus_one: 3,
            sps: vec![sps],
            pps: vec![pps],
        })
    }

    /// Builds a record from an Annex-B buffer that carries SPS and PPS.
    #[must_use]
    pub fn from_annexb(data: &[u8]) -> Option<Self> {
        match extract_parameter_sets(data) {
            (Some(sps), Some(pps)) => Self::from_parameter_sets(sps, pps).ok(),
            _ => None,
        }
    }

    pub fn parse(data: BytesMut) -> Result<Self, H264Error> {
        let mut reader = BytesReader::new(data);
        let version = reader.read_u8()?;
        if version != 1 {
            return Err(H264ErrorValue::UnsupportedConfigVersion(version).into());
        }
        let profile_indication = reader.read_u8()?;
        let profile_compatibility = reader.read_u8()?;
        let level_indication = reader.read_u8()?;
        let length_size_minus_one = reader.read_u8()? & 0x03;

        let num_sps = reader.read_u8()? & 0x1F;
        let mut sps = Vec::with_capacity(num_sps as usize);
        for _ in 0..num_sps {
            let len = reader.read_u16::<BigEndian>()? as usize;
            sps.push(reader.read_bytes(len)?.freeze());
        }

        let num_pps = reader.read_u8()?;
        let mut pps = Vec::with_capacity(num_pps as usize);
        for _ in 0..num_pps {
            let len = reader.read_u16::<BigEndian>()? as usize;
            pps.push(reader.read_bytes(len)?.freeze());
        }

        Ok(Self {
            profile_indication,
            profile_compatibility,
            level_indication,
            length_size_minus_one,
            sps,
            pps,
        })
    }

    pub fn write(&self) -> Result<BytesMut, BytesWriteError> {
        let mut writer = BytesWriter::new();
        writer.write_u8(1)?;
        writer.write_u8(self.profile_indication)?;
        writer.write_u8(self.profile_compatibility)?;
        writer.write_u8(self.level_indication)?;
        writer.write_u8(0xFC | (self.length_size_minus_one & 0x03))?;

        writer.write_u8(0xE0 | (self.sps.len() as u8 & 0x1F))?;
        for sps in &self.sps {
            writer.write_u16::<BigEndian>(sps.len() as u16)?;
            writer.write(sps)?;
        }
        writer.write_u8(self.pps.len() as u8)?;
        for pps in &self.pps {
            writer.write_u16::<BigEndian>(pps.len() as u16)?;
            writer.write(pps)?;
        }
        Ok(writer.extract_current_bytes())
    }

    /// Parameter sets as an Annex-B prefix, prepended to keyframes when
    /// converting out of a length-prefixed container.
    #[must_use]
    pub fn parameter_sets_annexb(&self) -> BytesMut {
        to_annexb(self.sps.iter().chain(self.pps.iter()).map(|b| &b[..]))
    }

    #[must_use]
    pub fn length_size(&self) -> usize {
        usize::from(self.length_size_minus_one) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_write_parse() {
        let record = AvcDecoderConfigurationRecord::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x64, 0x00, 0x28, 0xac]),
            Bytes::from_static(&[0x68, 0xee, 0x3c, 0x80]),
        )
        .unwrap();
        let bytes = record.write().unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 0x64);
        assert_eq!(bytes[4], 0xFF);

        let parsed = AvcDecoderConfigurationRecord::parse(bytes).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.length_size(), 4);
    }

    #[test]
    fn test_record_rejects_short_sps() {
        assert!(AvcDecoderConfigurationRecord::from_parameter_sets(
            Bytes::from_static(&[0x67]),
            Bytes::from_static(&[0x68]),
        )
        .is_err());
    }

    #[test]
    fn test_parameter_sets_annexb() {
        let record = AvcDecoderConfigurationRecord::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]),
            Bytes::from_static(&[0x68, 0xce]),
        )
        .unwrap();
        let annexb = record.parameter_sets_annexb();
        assert_eq!(&annexb[..], &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0, 0, 0, 1, 0x68, 0xce]);
    }
}
