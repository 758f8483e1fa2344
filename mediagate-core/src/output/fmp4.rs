//! Fragmented MP4 packaging for HTTP-fMP4 and HLS-fMP4.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mediagate_media::{
    aac::AudioSpecificConfig,
    fmp4::{self, AudioTrackConfig, Sample, TrackFragment, VideoTrackConfig, AUDIO_TRACK_ID, VIDEO_TIMESCALE, VIDEO_TRACK_ID},
    h264::{self, config::AvcDecoderConfigurationRecord, sps::parse_sps},
};

use super::{spawn_body, AttachOptions, FrameConsumer, OutputAdapter, OutputSession, Packager};
use crate::{
    error::Result,
    frame::{CodecTag, Frame, Protocol, TrackInfo},
    registry::StreamHandle,
};

/// Used for the last buffered video sample when no successor arrives.
const FALLBACK_VIDEO_DURATION_MS: i64 = 40;
const AAC_SAMPLES_PER_FRAME: u32 = 1024;

fn ticks(ms: i64, timescale: u32) -> u64 {
    (i128::from(ms.max(0)) * i128::from(timescale) / 1000) as u64
}

fn video_config(track: &TrackInfo) -> Option<VideoTrackConfig> {
    let record = AvcDecoderConfigurationRecord::from_annexb(track.config.as_ref()?)?;
    let avcc = record.write().ok()?.freeze();
    let (sps, _) = h264::extract_parameter_sets(track.config.as_ref()?);
    let (width, height) = sps
        .and_then(|sps| parse_sps(&sps).ok())
        .map(|info| (info.width, info.height))
        .unwrap_or_default();
    Some(VideoTrackConfig {
        width: u16::try_from(width).unwrap_or(u16::MAX),
        height: u16::try_from(height).unwrap_or(u16::MAX),
        avcc,
    })
}

fn audio_config(track: &TrackInfo) -> Option<AudioTrackConfig> {
    let asc = track.config.clone()?;
    let parsed = AudioSpecificConfig::parse(&asc)?;
    Some(AudioTrackConfig {
        sample_rate: parsed.sample_rate(),
        channels: u16::from(parsed.channel_configuration.max(1)),
        asc,
    })
}

/// Turns frames into `moof`/`mdat` fragments. A video sample is completed
/// by the next video frame, which supplies its duration, so the newest
/// video frame is always held back.
#[derive(Debug, Default)]
pub struct Fmp4Fragmenter {
    has_video: bool,
    audio_rate: Option<u32>,
    origin: Option<i64>,
    sequence: u32,
    pending_video: Option<Frame>,
    last_video_duration: Option<u32>,
    video_base: Option<u64>,
    video_samples: Vec<Sample>,
    audio_base: Option<u64>,
    audio_samples: Vec<Sample>,
}

impl Fmp4Fragmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Init segment for the H.264 / AAC tracks; fixes which tracks the
    /// fragments carry. `None` when no track can be carried.
    pub fn init_segment(&mut self, tracks: &[TrackInfo]) -> Result<Option<Bytes>> {
        let video = tracks.iter().find(|t| t.codec == CodecTag::H264).and_then(video_config);
        let audio = tracks.iter().find(|t| t.codec == CodecTag::Aac).and_then(audio_config);
        if video.is_none() && audio.is_none() {
            return Ok(None);
        }
        self.has_video = video.is_some();
        self.audio_rate = audio.as_ref().map(|a| a.sample_rate);
        Ok(Some(fmp4::init_segment(video.as_ref(), audio.as_ref())?.freeze()))
    }

    #[must_use]
    pub const fn has_video(&self) -> bool {
        self.has_video
    }

    pub fn push(&mut self, frame: &Frame) {
        match frame.codec {
            CodecTag::H264 if self.has_video => {
                let origin = *self.origin.get_or_insert(frame.dts_ms);
                if let Some(previous) = self.pending_video.replace(frame.clone()) {
                    let delta = frame.dts_ms - previous.dts_ms;
                    let duration = if delta > 0 {
                        ticks(delta, VIDEO_TIMESCALE) as u32
                    } else {
                        self.last_video_duration
                            .unwrap_or(ticks(FALLBACK_VIDEO_DURATION_MS, VIDEO_TIMESCALE) as u32)
                    };
                    self.last_video_duration = Some(duration);
                    self.complete_video(&previous, duration, origin);
                }
            }
            CodecTag::Aac => {
                let Some(rate) = self.audio_rate else {
                    return;
                };
                let origin = *self.origin.get_or_insert(frame.dts_ms);
                self.audio_base
                    .get_or_insert_with(|| ticks(frame.pts_ms - origin, rate));
                self.audio_samples.push(Sample {
                    duration: AAC_SAMPLES_PER_FRAME,
                    cts_offset: 0,
                    keyframe: true,
                    data: frame.payload.clone(),
                });
            }
            _ => {}
        }
    }

    fn complete_video(&mut self, frame: &Frame, duration: u32, origin: i64) {
        self.video_base
            .get_or_insert_with(|| ticks(frame.dts_ms - origin, VIDEO_TIMESCALE));
        let cts = ticks(frame.pts_ms - frame.dts_ms, VIDEO_TIMESCALE);
        self.video_samples.push(Sample {
            duration,
            cts_offset: i32::try_from(cts).unwrap_or(0),
            keyframe: frame.keyframe,
            data: h264::annexb_to_avcc(&frame.payload, false).freeze(),
        });
    }

    /// Completed samples as one media segment, if there are any.
    pub fn fragment(&mut self) -> Result<Option<Bytes>> {
        let mut fragments = Vec::with_capacity(2);
        if !self.video_samples.is_empty() {
            fragments.push(TrackFragment {
                track_id: VIDEO_TRACK_ID,
                base_media_decode_time: self.video_base.take().unwrap_or_default(),
                samples: std::mem::take(&mut self.video_samples),
            });
        }
        if !self.audio_samples.is_empty() {
            fragments.push(TrackFragment {
                track_id: AUDIO_TRACK_ID,
                base_media_decode_time: self.audio_base.take().unwrap_or_default(),
                samples: std::mem::take(&mut self.audio_samples),
            });
        }
        if fragments.is_empty() {
            return Ok(None);
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(fmp4::media_segment(self.sequence, &fragments)?.freeze()))
    }

    /// Completes the held-back video frame with the last known duration.
    pub fn finish(&mut self) -> Result<Option<Bytes>> {
        if let Some(last) = self.pending_video.take() {
            let duration = self
                .last_video_duration
                .unwrap_or(ticks(FALLBACK_VIDEO_DURATION_MS, VIDEO_TIMESCALE) as u32);
            let origin = self.origin.unwrap_or(last.dts_ms);
            self.complete_video(&last, duration, origin);
        }
        self.fragment()
    }
}

/// HTTP-fMP4: init segment on the first keyframe, then one fragment per
/// completed video sample (or audio frame, for audio-only streams).
#[derive(Debug, Default)]
pub struct Fmp4Packager {
    fragmenter: Fmp4Fragmenter,
    started: bool,
}

impl Fmp4Packager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Packager for Fmp4Packager {
    fn push(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<Option<Bytes>> {
        let mut out = BytesMut::new();
        if !self.started {
            let video_expected = tracks.iter().any(|t| t.codec == CodecTag::H264);
            if video_expected && !(frame.is_video() && frame.keyframe) {
                return Ok(None);
            }
            let Some(init) = self.fragmenter.init_segment(tracks)? else {
                return Ok(None);
            };
            out.extend_from_slice(&init);
            self.started = true;
        }
        self.fragmenter.push(frame);
        if let Some(fragment) = self.fragmenter.fragment()? {
            out.extend_from_slice(&fragment);
        }
        Ok((!out.is_empty()).then(|| out.freeze()))
    }

    fn finish(&mut self) -> Result<Option<Bytes>> {
        if self.started {
            self.fragmenter.finish()
        } else {
            Ok(None)
        }
    }
}

pub struct Fmp4Output;

#[async_trait]
impl OutputAdapter for Fmp4Output {
    fn protocol(&self) -> Protocol {
        Protocol::HttpFmp4
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        let consumer = FrameConsumer::attach(stream, Protocol::HttpFmp4, &options)?;
        Ok(OutputSession::Body(spawn_body(consumer, Fmp4Packager::new(), "video/mp4")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::{aac_track, audio, video, video_track};

    fn boxes(data: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        let mut offset = 0;
        while offset + 8 <= data.len() {
            let size = u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]) as usize;
            names.push(String::from_utf8_lossy(&data[offset + 4..offset + 8]).into_owned());
            if size < 8 {
                break;
            }
            offset += size;
        }
        names
    }

    #[test]
    fn test_init_then_fragments() {
        let tracks = vec![video_track(), aac_track()];
        let mut packager = Fmp4Packager::new();
        assert!(packager.push(&video(0, false), &tracks).unwrap().is_none());

        let first = packager.push(&video(40, true), &tracks).unwrap().unwrap();
        // nothing completed yet, only the init segment
        assert_eq!(boxes(&first), ["ftyp", "moov"]);

        let audio_chunk = packager.push(&audio(50), &tracks).unwrap().unwrap();
        assert_eq!(boxes(&audio_chunk), ["moof", "mdat"]);

        let video_chunk = packager.push(&video(80, false), &tracks).unwrap().unwrap();
        assert_eq!(boxes(&video_chunk), ["moof", "mdat"]);

        let tail = packager.finish().unwrap().unwrap();
        assert_eq!(boxes(&tail), ["moof", "mdat"]);
    }

    #[test]
    fn test_video_durations_and_base() {
        let mut fragmenter = Fmp4Fragmenter::new();
        fragmenter.init_segment(&[video_track()]).unwrap().unwrap();
        fragmenter.push(&video(1000, true));
        fragmenter.push(&video(1040, false));
        fragmenter.push(&video(1100, false));
        assert_eq!(fragmenter.video_samples.len(), 2);
        assert_eq!(fragmenter.video_samples[0].duration, 3600);
        assert_eq!(fragmenter.video_samples[1].duration, 5400);
        assert_eq!(fragmenter.video_base, Some(0));
        assert!(fragmenter.fragment().unwrap().is_some());
        assert!(fragmenter.fragment().unwrap().is_none());
    }

    #[test]
    fn test_untracked_codecs_give_no_init() {
        let g711 = TrackInfo::audio(CodecTag::G711A, 8000, None);
        let mut fragmenter = Fmp4Fragmenter::new();
        assert!(fragmenter.init_segment(&[g711]).unwrap().is_none());
    }
}
