use {
    super::{
        define::{pid, stream_id, stream_type, PCR_INTERVAL_MS, SYNC_BYTE, TS_PACKET_SIZE},
        errors::{MpegTsError, MpegTsErrorValue},
        pat::{Pat, PatMuxer},
        pes::{ms_to_90k, pes_header},
        pmt::{Pmt, PmtMuxer, PmtStream},
    },
    crate::{
        aac::AudioSpecificConfig,
        h264::{self, nal_type},
    },
    bytes::{BufMut, Bytes, BytesMut},
};

const PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const AUD: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

#[derive(Debug, Clone, Copy)]
struct Track {
    pid: u16,
    stream_type: u8,
    continuity: u8,
}

/// Writes a single-program transport stream. PAT/PMT are repeated before
/// every video keyframe so that any segment cut on a keyframe is decodable
/// on its own.
pub struct TsMuxer {
    video: Option<Track>,
    audio: Option<Track>,
    pat_cc: u8,
    pmt_cc: u8,
    audio_config: Option<AudioSpecificConfig>,
    video_parameter_sets: Option<Bytes>,
    last_pcr_ms: Option<i64>,
    out: BytesMut,
}

impl TsMuxer {
    pub fn new(video_type: Option<u8>, audio_type: Option<u8>) -> Result<Self, MpegTsError> {
        if let Some(t) = video_type.filter(|t| !stream_type::is_video(*t)) {
            return Err(MpegTsErrorValue::UnsupportedStreamType(t).into());
        }
        if let Some(t) = audio_type
            .filter(|t| !matches!(*t, stream_type::AAC | stream_type::G711A | stream_type::G711U))
        {
            return Err(MpegTsErrorValue::UnsupportedStreamType(t).into());
        }
        Ok(Self {
            video: video_type.map(|stream_type| Track {
                pid: pid::VIDEO,
                stream_type,
                continuity: 0,
            }),
            audio: audio_type.map(|stream_type| Track {
                pid: pid::AUDIO,
                stream_type,
                continuity: 0,
            }),
            pat_cc: 0,
            pmt_cc: 0,
            audio_config: None,
            video_parameter_sets: None,
            last_pcr_ms: None,
            out: BytesMut::new(),
        })
    }

    /// AAC access units are written as ADTS; the config supplies the header.
    pub fn set_audio_config(&mut self, config: AudioSpecificConfig) {
        self.audio_config = Some(config);
    }

    /// Annex-B SPS/PPS prepended to keyframes that arrive without them.
    pub fn set_video_parameter_sets(&mut self, annexb: Bytes) {
        self.video_parameter_sets = Some(annexb);
    }

    const fn pcr_pid(&self) -> u16 {
        match (self.video, self.audio) {
            (None, Some(audio)) => audio.pid,
            _ => pid::VIDEO,
        }
    }

    pub fn write_tables(&mut self) -> Result<(), MpegTsError> {
        let mut pat = Pat::new();
        pat.programs.push((1, pid::PMT));
        let pat = PatMuxer::new().write(&pat)?;

        let pmt = Pmt {
            pid: pid::PMT,
            program_number: 1,
            version_number: 0,
            pcr_pid: self.pcr_pid(),
            streams: self
                .video
                .iter()
                .chain(self.audio.iter())
                .map(|track| PmtStream {
                    stream_type: track.stream_type,
                    pid: track.pid,
                })
                .collect(),
        };
        let pmt = PmtMuxer::new().write(&pmt)?;

        let cc = self.pat_cc;
        self.pat_cc = (cc + 1) & 0x0F;
        self.write_section(pid::PAT, cc, &pat);
        let cc = self.pmt_cc;
        self.pmt_cc = (cc + 1) & 0x0F;
        self.write_section(pid::PMT, cc, &pmt);
        Ok(())
    }

    fn write_section(&mut self, pid: u16, cc: u8, section: &[u8]) {
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;
        packet[3] = 0x10 | cc;
        packet[4] = 0; // pointer_field
        let len = section.len().min(TS_PACKET_SIZE - 5);
        packet[5..5 + len].copy_from_slice(&section[..len]);
        self.out.put_slice(&packet);
    }

    /// Writes one Annex-B access unit.
    pub fn write_video(
        &mut self,
        pts_ms: i64,
        dts_ms: i64,
        keyframe: bool,
        annexb: &[u8],
    ) -> Result<(), MpegTsError> {
        let Some(track) = self.video else {
            return Err(MpegTsErrorValue::StreamNotFound(pid::VIDEO).into());
        };
        if keyframe {
            self.write_tables()?;
        }

        let units = h264::split_annexb(annexb);
        let has_aud = units.first().is_some_and(|u| !u.is_empty() && h264::nal_unit_type(u[0]) == nal_type::AUD);
        let has_sps = units.iter().any(|u| !u.is_empty() && h264::nal_unit_type(u[0]) == nal_type::SPS);

        let mut es = BytesMut::with_capacity(annexb.len() + 64);
        if !has_aud && track.stream_type == stream_type::H264 {
            es.put_slice(&AUD);
        }
        if keyframe && !has_sps && track.stream_type == stream_type::H264 {
            if let Some(parameter_sets) = &self.video_parameter_sets {
                es.put_slice(parameter_sets);
            }
        }
        es.put_slice(annexb);

        let pcr = self.take_pcr(track.pid, dts_ms, keyframe);
        self.write_pes(
            track.pid,
            stream_id::VIDEO,
            ms_to_90k(pts_ms),
            Some(ms_to_90k(dts_ms)),
            keyframe,
            pcr,
            &es,
        );
        Ok(())
    }

    /// Writes one audio access unit (raw AAC or G.711 samples).
    pub fn write_audio(&mut self, pts_ms: i64, data: &[u8]) -> Result<(), MpegTsError> {
        let Some(track) = self.audio else {
            return Err(MpegTsErrorValue::StreamNotFound(pid::AUDIO).into());
        };
        let es = match (track.stream_type, self.audio_config) {
            (stream_type::AAC, Some(config)) if !is_adts(data) => config.wrap_adts(data),
            _ => BytesMut::from(data),
        };
        let pcr = self.take_pcr(track.pid, pts_ms, self.video.is_none());
        self.write_pes(track.pid, stream_id::AUDIO, ms_to_90k(pts_ms), None, false, pcr, &es);
        Ok(())
    }

    fn take_pcr(&mut self, pid: u16, dts_ms: i64, force: bool) -> Option<u64> {
        if pid != self.pcr_pid() {
            return None;
        }
        let due = self
            .last_pcr_ms
            .is_none_or(|last| force || dts_ms - last >= PCR_INTERVAL_MS || dts_ms < last);
        if due {
            self.last_pcr_ms = Some(dts_ms);
            Some(ms_to_90k(dts_ms))
        } else {
            None
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let track = match (&mut self.video, &mut self.audio) {
            (Some(video), _) if video.pid == pid => video,
            (_, Some(audio)) if audio.pid == pid => audio,
            _ => return 0,
        };
        let cc = track.continuity;
        track.continuity = (cc + 1) & 0x0F;
        cc
    }

    #[allow(clippy::too_many_arguments)]
    fn write_pes(
        &mut self,
        pid: u16,
        stream_id: u8,
        pts: u64,
        dts: Option<u64>,
        random_access: bool,
        pcr: Option<u64>,
        es: &[u8],
    ) {
        let header = pes_header(stream_id, pts, dts, es.len());
        let mut pes = BytesMut::with_capacity(header.len() + es.len());
        pes.put_slice(&header);
        pes.put_slice(es);

        let mut offset = 0;
        let mut first = true;
        while offset < pes.len() {
            let mut adaptation: Vec<u8> = Vec::new();
            if first && (random_access || pcr.is_some()) {
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                adaptation.push(flags);
                if let Some(base) = pcr {
                    adaptation.extend_from_slice(&[
                        (base >> 25) as u8,
                        (base >> 17) as u8,
                        (base >> 9) as u8,
                        (base >> 1) as u8,
                        (((base & 1) as u8) << 7) | 0x7E,
                        0,
                    ]);
                }
            }

            let remaining = pes.len() - offset;
            let mut af_total = if adaptation.is_empty() { 0 } else { 1 + adaptation.len() };
            if remaining < PAYLOAD_SIZE - af_total {
                af_total = PAYLOAD_SIZE - remaining;
            }
            let payload_len = PAYLOAD_SIZE - af_total;

            let mut packet = [0xFFu8; TS_PACKET_SIZE];
            packet[0] = SYNC_BYTE;
            packet[1] = (if first { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1F);
            packet[2] = pid as u8;
            let cc = self.next_cc(pid);
            packet[3] = (if af_total > 0 { 0x30 } else { 0x10 }) | cc;
            if af_total > 0 {
                packet[4] = (af_total - 1) as u8;
                if af_total > 1 {
                    if adaptation.is_empty() {
                        packet[5] = 0x00;
                    } else {
                        packet[5..5 + adaptation.len()].copy_from_slice(&adaptation);
                    }
                }
            }
            let start = 4 + af_total;
            packet[start..].copy_from_slice(&pes[offset..offset + payload_len]);
            self.out.put_slice(&packet);

            offset += payload_len;
            first = false;
        }
    }

    /// Drains everything written so far.
    pub fn take(&mut self) -> BytesMut {
        self.out.split()
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.out.len()
    }
}

fn is_adts(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}

#[cfg(test)]
mod tests {
    use {super::*, crate::mpegts::demuxer::TsDemuxer};

    const IDR: [u8; 12] = [0, 0, 0, 1, 0x67, 0x42, 0, 0x1F, 0, 0, 1, 0x65];

    #[test]
    fn test_keyframe_starts_with_tables() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), Some(stream_type::AAC)).unwrap();
        muxer.write_video(0, 0, true, &IDR).unwrap();
        let out = muxer.take();
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        // PAT, PMT, then the video PES
        assert_eq!(out[1] & 0x1F, 0);
        assert_eq!(out[2], 0);
        let pmt_pid = (u16::from(out[TS_PACKET_SIZE + 1] & 0x1F) << 8) | u16::from(out[TS_PACKET_SIZE + 2]);
        assert_eq!(pmt_pid, pid::PMT);
        // random access indicator and PCR flag on the first video packet
        let video = &out[2 * TS_PACKET_SIZE..];
        assert_eq!(video[3] & 0x30, 0x30);
        assert_eq!(video[5] & 0x50, 0x50);
    }

    #[test]
    fn test_large_frame_continuity() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), None).unwrap();
        let mut frame = vec![0, 0, 0, 1, 0x41];
        frame.extend(std::iter::repeat_n(0xAB, 5000));
        muxer.write_video(40, 40, false, &frame).unwrap();
        let out = muxer.take();
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for (i, packet) in out.chunks(TS_PACKET_SIZE).enumerate() {
            assert_eq!(packet[0], SYNC_BYTE);
            assert_eq!(packet[3] & 0x0F, (i & 0x0F) as u8);
        }
    }

    #[test]
    fn test_demux_roundtrip_video_and_audio() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), Some(stream_type::AAC)).unwrap();
        muxer.set_audio_config(AudioSpecificConfig::lc(44100, 2).unwrap());
        muxer.write_video(1000, 1000, true, &IDR).unwrap();
        muxer.write_audio(1010, &[0x21, 0x10, 0x04]).unwrap();
        muxer.write_video(1040, 1040, false, &[0, 0, 0, 1, 0x41, 0x9A]).unwrap();

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&muxer.take()).unwrap();
        frames.extend(demuxer.flush());
        assert_eq!(frames.len(), 3);
        assert!(frames[0].random_access);
        assert_eq!(frames[0].pts, 90_000);
        // AUD prepended
        assert_eq!(&frames[0].data[..6], &AUD);
        assert_eq!(frames[1].stream_type, stream_type::AAC);
        assert_eq!(frames[1].data.len(), 7 + 3);
        assert_eq!(frames[2].pts, 1040 * 90);
    }

    #[test]
    fn test_parameter_sets_injected_on_bare_idr() {
        let mut muxer = TsMuxer::new(Some(stream_type::H264), None).unwrap();
        muxer.set_video_parameter_sets(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]));
        muxer.write_video(0, 0, true, &[0, 0, 0, 1, 0x65, 0x88]).unwrap();
        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&muxer.take()).unwrap();
        frames.extend(demuxer.flush());
        let units = h264::split_annexb(&frames[0].data);
        let types: Vec<u8> = units.iter().map(|u| h264::nal_unit_type(u[0])).collect();
        assert_eq!(types, vec![nal_type::AUD, nal_type::SPS, nal_type::PPS, nal_type::IDR]);
    }

    #[test]
    fn test_rejects_unknown_stream_type() {
        assert!(TsMuxer::new(Some(stream_type::AAC), None).is_err());
    }
}
