//! Fragmented MP4 (ISO/IEC 14496-12): an init segment (`ftyp` + `moov` with
//! `mvex`) and media segments (`moof` + `mdat`) for HLS-fMP4 and HTTP-fMP4.

pub mod errors;

use {
    bytes::{BufMut, Bytes, BytesMut},
    errors::{Fmp4Error, Fmp4ErrorValue},
};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;
pub const VIDEO_TIMESCALE: u32 = 90_000;

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrackConfig {
    pub width: u16,
    pub height: u16,
    /// Serialized AVCDecoderConfigurationRecord.
    pub avcc: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// AudioSpecificConfig.
    pub asc: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// In the track's timescale.
    pub duration: u32,
    pub cts_offset: i32,
    pub keyframe: bool,
    /// Length-prefixed NAL units for video, a raw access unit for audio.
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFragment {
    pub track_id: u32,
    pub base_media_decode_time: u64,
    pub samples: Vec<Sample>,
}

/// Nested box builder; sizes are patched when a box is closed.
#[derive(Default)]
struct BoxWriter {
    buf: BytesMut,
    open: Vec<usize>,
}

impl BoxWriter {
    fn begin(&mut self, kind: &[u8; 4]) {
        self.open.push(self.buf.len());
        self.buf.put_u32(0);
        self.buf.put_slice(kind);
    }

    fn begin_full(&mut self, kind: &[u8; 4], version: u8, flags: u32) {
        self.begin(kind);
        self.buf.put_u32((u32::from(version) << 24) | (flags & 0x00FF_FFFF));
    }

    fn end(&mut self) -> Result<(), Fmp4Error> {
        let start = self.open.pop().unwrap_or_default();
        let size = u32::try_from(self.buf.len() - start)
            .map_err(|_| Fmp4ErrorValue::BoxTooLarge("box"))?;
        self.buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }

    fn zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }
}

/// `ftyp` + `moov` for up to one video (H.264) and one audio (AAC) track.
pub fn init_segment(
    video: Option<&VideoTrackConfig>,
    audio: Option<&AudioTrackConfig>,
) -> Result<BytesMut, Fmp4Error> {
    if video.is_none() && audio.is_none() {
        return Err(Fmp4ErrorValue::NoTracks.into());
    }
    let mut w = BoxWriter::default();

    w.begin(b"ftyp");
    w.buf.put_slice(b"isom");
    w.buf.put_u32(0x200);
    for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
        w.buf.put_slice(brand);
    }
    w.end()?;

    w.begin(b"moov");
    w.begin_full(b"mvhd", 0, 0);
    w.buf.put_u32(0); // creation_time
    w.buf.put_u32(0); // modification_time
    w.buf.put_u32(1000);
    w.buf.put_u32(0); // duration
    w.buf.put_u32(0x0001_0000); // rate
    w.buf.put_u16(0x0100); // volume
    w.zeros(10);
    for value in UNITY_MATRIX {
        w.buf.put_u32(value);
    }
    w.zeros(24);
    w.buf.put_u32(AUDIO_TRACK_ID + 1); // next_track_ID
    w.end()?;

    if let Some(video) = video {
        write_trak(&mut w, VIDEO_TRACK_ID, VIDEO_TIMESCALE, TrackKind::Video(video))?;
    }
    if let Some(audio) = audio {
        write_trak(&mut w, AUDIO_TRACK_ID, audio.sample_rate, TrackKind::Audio(audio))?;
    }

    w.begin(b"mvex");
    for track_id in video
        .map(|_| VIDEO_TRACK_ID)
        .into_iter()
        .chain(audio.map(|_| AUDIO_TRACK_ID))
    {
        w.begin_full(b"trex", 0, 0);
        w.buf.put_u32(track_id);
        w.buf.put_u32(1); // default_sample_description_index
        w.buf.put_u32(0);
        w.buf.put_u32(0);
        w.buf.put_u32(0);
        w.end()?;
    }
    w.end()?; // mvex
    w.end()?; // moov
    Ok(w.buf)
}

#[derive(Clone, Copy)]
enum TrackKind<'a> {
    Video(&'a VideoTrackConfig),
    Audio(&'a AudioTrackConfig),
}

fn write_trak(w: &mut BoxWriter, track_id: u32, timescale: u32, kind: TrackKind<'_>) -> Result<(), Fmp4Error> {
    w.begin(b"trak");

    w.begin_full(b"tkhd", 0, 0x03);
    w.buf.put_u32(0);
    w.buf.put_u32(0);
    w.buf.put_u32(track_id);
    w.buf.put_u32(0);
    w.buf.put_u32(0); // duration
    w.zeros(8);
    w.buf.put_u16(0); // layer
    w.buf.put_u16(0); // alternate_group
    w.buf.put_u16(if matches!(kind, TrackKind::Audio(_)) { 0x0100 } else { 0 });
    w.buf.put_u16(0);
    for value in UNITY_MATRIX {
        w.buf.put_u32(value);
    }
    let (width, height) = match kind {
        TrackKind::Video(v) => (u32::from(v.width), u32::from(v.height)),
        TrackKind::Audio(_) => (0, 0),
    };
    w.buf.put_u32(width << 16);
    w.buf.put_u32(height << 16);
    w.end()?;

    w.begin(b"mdia");
    w.begin_full(b"mdhd", 0, 0);
    w.buf.put_u32(0);
    w.buf.put_u32(0);
    w.buf.put_u32(timescale);
    w.buf.put_u32(0);
    w.buf.put_u16(0x55C4); // und
    w.buf.put_u16(0);
    w.end()?;

    let (handler, name): (&[u8; 4], &[u8]) = match kind {
        TrackKind::Video(_) => (b"vide", b"VideoHandler\0"),
        TrackKind::Audio(_) => (b"soun", b"SoundHandler\0"),
    };
    w.begin_full(b"hdlr", 0, 0);
    w.buf.put_u32(0);
    w.buf.put_slice(handler);
    w.zeros(12);
    w.buf.put_slice(name);
    w.end()?;

    w.begin(b"minf");
    match kind {
        TrackKind::Video(_) => {
            w.begin_full(b"vmhd", 0, 1);
            w.zeros(8);
            w.end()?;
        }
        TrackKind::Audio(_) => {
            w.begin_full(b"smhd", 0, 0);
            w.zeros(4);
            w.end()?;
        }
    }
    w.begin(b"dinf");
    w.begin_full(b"dref", 0, 0);
    w.buf.put_u32(1);
    w.begin_full(b"url ", 0, 1);
    w.end()?;
    w.end()?; // dref
    w.end()?; // dinf

    w.begin(b"stbl");
    w.begin_full(b"stsd", 0, 0);
    w.buf.put_u32(1);
    match kind {
        TrackKind::Video(video) => write_avc1(w, video)?,
        TrackKind::Audio(audio) => write_mp4a(w, audio)?,
    }
    w.end()?; // stsd
    for table in [b"stts", b"stsc", b"stco"] {
        w.begin_full(table, 0, 0);
        w.buf.put_u32(0);
        w.end()?;
    }
    w.begin_full(b"stsz", 0, 0);
    w.buf.put_u32(0);
    w.buf.put_u32(0);
    w.end()?;
    w.end()?; // stbl
    w.end()?; // minf
    w.end()?; // mdia
    w.end() // trak
}

fn write_avc1(w: &mut BoxWriter, video: &VideoTrackConfig) -> Result<(), Fmp4Error> {
    w.begin(b"avc1");
    w.zeros(6);
    w.buf.put_u16(1); // data_reference_index
    w.zeros(16);
    w.buf.put_u16(video.width);
    w.buf.put_u16(video.height);
    w.buf.put_u32(0x0048_0000);
    w.buf.put_u32(0x0048_0000);
    w.buf.put_u32(0);
    w.buf.put_u16(1); // frame_count
    w.zeros(32); // compressorname
    w.buf.put_u16(0x0018);
    w.buf.put_u16(0xFFFF);
    w.begin(b"avcC");
    w.buf.put_slice(&video.avcc);
    w.end()?;
    w.end()
}

fn descriptor(tag: u8, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(tag);
    // 4-byte expandable length keeps the layout fixed
    let len = body.len() as u32;
    out.put_slice(&[
        0x80 | ((len >> 21) & 0x7F) as u8,
        0x80 | ((len >> 14) & 0x7F) as u8,
        0x80 | ((len >> 7) & 0x7F) as u8,
        (len & 0x7F) as u8,
    ]);
    out.put_slice(body);
    out
}

fn write_mp4a(w: &mut BoxWriter, audio: &AudioTrackConfig) -> Result<(), Fmp4Error> {
    w.begin(b"mp4a");
    w.zeros(6);
    w.buf.put_u16(1);
    w.zeros(8);
    w.buf.put_u16(audio.channels);
    w.buf.put_u16(16);
    w.buf.put_u32(0);
    w.buf.put_u32(audio.sample_rate << 16);

    let decoder_specific = descriptor(0x05, &audio.asc);
    let mut decoder_config = BytesMut::new();
    decoder_config.put_u8(0x40); // MPEG-4 audio
    decoder_config.put_u8(0x15); // audio stream
    decoder_config.put_slice(&[0, 0, 0]);
    decoder_config.put_u32(0);
    decoder_config.put_u32(0);
    decoder_config.put_slice(&decoder_specific);
    let decoder_config = descriptor(0x04, &decoder_config);

    let mut es = BytesMut::new();
    es.put_u16(0); // ES_ID
    es.put_u8(0);
    es.put_slice(&decoder_config);
    es.put_slice(&descriptor(0x06, &[0x02]));

    w.begin_full(b"esds", 0, 0);
    w.buf.put_slice(&descriptor(0x03, &es));
    w.end()?;
    w.end()
}

/// `moof` + `mdat` for one fragment. Track data is laid out in `mdat` in the
/// order the fragments are given.
pub fn media_segment(sequence: u32, fragments: &[TrackFragment]) -> Result<BytesMut, Fmp4Error> {
    if fragments.is_empty() {
        return Err(Fmp4ErrorValue::NoTracks.into());
    }
    for fragment in fragments {
        if fragment.track_id != VIDEO_TRACK_ID && fragment.track_id != AUDIO_TRACK_ID {
            return Err(Fmp4ErrorValue::UnknownTrack(fragment.track_id).into());
        }
    }

    let mut w = BoxWriter::default();
    let mut data_offset_positions = Vec::with_capacity(fragments.len());

    w.begin(b"moof");
    w.begin_full(b"mfhd", 0, 0);
    w.buf.put_u32(sequence);
    w.end()?;

    for fragment in fragments {
        w.begin(b"traf");
        w.begin_full(b"tfhd", 0, 0x02_0000);
        w.buf.put_u32(fragment.track_id);
        w.end()?;

        w.begin_full(b"tfdt", 1, 0);
        w.buf.put_u64(fragment.base_media_decode_time);
        w.end()?;

        w.begin_full(b"trun", 1, 0x000F01);
        w.buf.put_u32(fragment.samples.len() as u32);
        data_offset_positions.push(w.buf.len());
        w.buf.put_i32(0);
        for sample in &fragment.samples {
            w.buf.put_u32(sample.duration);
            w.buf.put_u32(sample.data.len() as u32);
            w.buf.put_u32(if sample.keyframe {
                SAMPLE_FLAGS_SYNC
            } else {
                SAMPLE_FLAGS_NON_SYNC
            });
            w.buf.put_i32(sample.cts_offset);
        }
        w.end()?; // trun
        w.end()?; // traf
    }
    w.end()?; // moof

    let moof_size = w.buf.len();
    let mut offset = moof_size + 8;
    for (fragment, position) in fragments.iter().zip(data_offset_positions) {
        let value = i32::try_from(offset).map_err(|_| Fmp4ErrorValue::BoxTooLarge("moof"))?;
        w.buf[position..position + 4].copy_from_slice(&value.to_be_bytes());
        offset += fragment.samples.iter().map(|s| s.data.len()).sum::<usize>();
    }

    w.begin(b"mdat");
    for fragment in fragments {
        for sample in &fragment.samples {
            w.buf.put_slice(&sample.data);
        }
    }
    w.end()?;
    Ok(w.buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_level_boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
        let mut boxes = Vec::new();
        let mut offset = 0;
        while offset + 8 <= data.len() {
            let size = u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]) as usize;
            let kind = String::from_utf8_lossy(&data[offset + 4..offset + 8]).to_string();
            boxes.push((kind, offset, size));
            offset += size;
        }
        assert_eq!(offset, data.len());
        boxes
    }

    fn video_config() -> VideoTrackConfig {
        VideoTrackConfig {
            width: 1280,
            height: 720,
            avcc: Bytes::from_static(&[1, 0x42, 0, 0x1F, 0xFF, 0xE1, 0, 2, 0x67, 0x42, 1, 0, 2, 0x68, 0xCE]),
        }
    }

    fn audio_config() -> AudioTrackConfig {
        AudioTrackConfig {
            sample_rate: 44100,
            channels: 2,
            asc: Bytes::from_static(&[0x12, 0x10]),
        }
    }

    #[test]
    fn test_init_segment_layout() {
        let init = init_segment(Some(&video_config()), Some(&audio_config())).unwrap();
        let boxes = top_level_boxes(&init);
        let kinds: Vec<&str> = boxes.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(kinds, vec!["ftyp", "moov"]);
        let moov = &init[boxes[1].1..];
        assert!(moov.windows(4).any(|w| w == b"avcC"));
        assert!(moov.windows(4).any(|w| w == b"esds"));
        assert_eq!(moov.windows(4).filter(|w| *w == b"trex").count(), 2);
    }

    #[test]
    fn test_init_requires_track() {
        assert!(init_segment(None, None).is_err());
    }

    #[test]
    fn test_media_segment_data_offsets() {
        let video = TrackFragment {
            track_id: VIDEO_TRACK_ID,
            base_media_decode_time: 90_000,
            samples: vec![
                Sample {
                    duration: 3600,
                    cts_offset: 0,
                    keyframe: true,
                    data: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0x88]),
                },
                Sample {
                    duration: 3600,
                    cts_offset: 3600,
                    keyframe: false,
                    data: Bytes::from_static(&[0, 0, 0, 1, 0x41]),
                },
            ],
        };
        let audio = TrackFragment {
            track_id: AUDIO_TRACK_ID,
            base_media_decode_time: 44100,
            samples: vec![Sample {
                duration: 1024,
                cts_offset: 0,
                keyframe: true,
                data: Bytes::from_static(&[0x21, 0x10]),
            }],
        };
        let segment = media_segment(7, &[video, audio]).unwrap();
        let boxes = top_level_boxes(&segment);
        assert_eq!(boxes[0].0, "moof");
        assert_eq!(boxes[1].0, "mdat");
        let mdat_payload = boxes[1].1 + 8;

        // first trun data_offset points at the start of mdat payload
        let trun = segment.windows(4).position(|w| w == b"trun").unwrap();
        let offset_pos = trun + 4 + 4 + 4;
        let offset = i32::from_be_bytes(segment[offset_pos..offset_pos + 4].try_into().unwrap());
        assert_eq!(offset as usize, mdat_payload);
        assert_eq!(&segment[mdat_payload..mdat_payload + 6], &[0, 0, 0, 2, 0x65, 0x88]);
        assert_eq!(&segment[segment.len() - 2..], &[0x21, 0x10]);
    }
}
