//! MPEG-TS packaging, shared by HTTP-TS, HLS and the recorder.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mediagate_media::{aac::AudioSpecificConfig, mpegts::muxer::TsMuxer};

use super::{spawn_body, AttachOptions, FrameConsumer, OutputAdapter, OutputSession, Packager};
use crate::{
    error::Result,
    frame::{CodecTag, Frame, Protocol, TrackInfo, TrackKind},
    registry::StreamHandle,
};

/// Wraps [`TsMuxer`] with the codec layout of the stream. Output starts at
/// the first video keyframe when the stream has video, and the muxer is
/// rebuilt on a keyframe if the track layout changed.
pub struct TsPackager {
    muxer: Option<TsMuxer>,
    video: Option<CodecTag>,
    audio: Option<CodecTag>,
    started: bool,
}

fn layout(tracks: &[TrackInfo], frame: &Frame) -> (Option<CodecTag>, Option<CodecTag>) {
    let pick = |kind: TrackKind| {
        tracks
            .iter()
            .find(|t| t.kind == kind && t.codec.stream_type().is_some())
            .map(|t| t.codec)
            .or_else(|| (frame.kind == kind && frame.codec.stream_type().is_some()).then_some(frame.codec))
    };
    (pick(TrackKind::Video), pick(TrackKind::Audio))
}

impl TsPackager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            muxer: None,
            video: None,
            audio: None,
            started: false,
        }
    }

    fn rebuild(&mut self, tracks: &[TrackInfo], frame: &Frame) -> Result<()> {
        let (video, audio) = layout(tracks, frame);
        if self.muxer.is_some() && (video, audio) == (self.video, self.audio) {
            return Ok(());
        }
        let mut muxer = TsMuxer::new(
            video.and_then(CodecTag::stream_type),
            audio.and_then(CodecTag::stream_type),
        )?;
        for track in tracks {
            match (track.codec, &track.config) {
                (CodecTag::Aac, Some(asc)) => {
                    if let Some(config) = AudioSpecificConfig::parse(asc) {
                        muxer.set_audio_config(config);
                    }
                }
                (CodecTag::H264 | CodecTag::H265, Some(parameter_sets)) => {
                    muxer.set_video_parameter_sets(parameter_sets.clone());
                }
                _ => {}
            }
        }
        if video.is_none() {
            // audio-only: tables up front, there is no keyframe to carry them
            muxer.write_tables()?;
        }
        self.muxer = Some(muxer);
        self.video = video;
        self.audio = audio;
        Ok(())
    }

    /// Writes one frame into the internal buffer. Returns false when the
    /// frame was skipped (before the first keyframe, or a codec the muxer
    /// has no track for).
    pub fn write(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<bool> {
        let opens_gop = frame.keyframe && (frame.is_video() || self.video.is_none());
        if opens_gop || self.muxer.is_none() {
            self.rebuild(tracks, frame)?;
        }
        if !self.started {
            let has_video = self.video.is_some();
            if has_video && !(frame.is_video() && frame.keyframe) {
                return Ok(false);
            }
            self.started = true;
        }
        let Some(muxer) = self.muxer.as_mut() else {
            return Ok(false);
        };
        match frame.kind {
            TrackKind::Video if self.video == Some(frame.codec) => {
                muxer.write_video(frame.pts_ms, frame.dts_ms, frame.keyframe, &frame.payload)?;
            }
            TrackKind::Audio if self.audio == Some(frame.codec) => {
                muxer.write_audio(frame.pts_ms, &frame.payload)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Takes everything written so far.
    pub fn take(&mut self) -> BytesMut {
        self.muxer.as_mut().map(TsMuxer::take).unwrap_or_default()
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.muxer.as_ref().map_or(0, TsMuxer::buffered)
    }

    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }
}

impl Default for TsPackager {
    fn default() -> Self {
        Self::new()
    }
}

impl Packager for TsPackager {
    fn push(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<Option<Bytes>> {
        self.write(frame, tracks)?;
        let out = self.take();
        Ok((!out.is_empty()).then(|| out.freeze()))
    }
}

pub struct TsOutput;

#[async_trait]
impl OutputAdapter for TsOutput {
    fn protocol(&self) -> Protocol {
        Protocol::HttpTs
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        let consumer = FrameConsumer::attach(stream, Protocol::HttpTs, &options)?;
        Ok(OutputSession::Body(spawn_body(consumer, TsPackager::new(), "video/mp2t")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::{aac_track, audio, video, video_track};
    use mediagate_media::mpegts::demuxer::TsDemuxer;

    #[test]
    fn test_output_starts_at_keyframe() {
        let tracks = vec![video_track(), aac_track()];
        let mut packager = TsPackager::new();
        assert!(packager.push(&audio(0), &tracks).unwrap().is_none());
        assert!(packager.push(&video(40, false), &tracks).unwrap().is_none());
        assert!(!packager.started());

        let mut out = BytesMut::new();
        for frame in [video(80, true), audio(90), video(120, false)] {
            out.extend_from_slice(&packager.push(&frame, &tracks).unwrap().unwrap());
        }
        assert_eq!(out.len() % 188, 0);

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&out).unwrap();
        frames.extend(demuxer.flush());
        assert_eq!(frames.len(), 3);
        let first = frames.iter().min_by_key(|f| f.pts).unwrap();
        assert!(first.random_access);
    }

    #[test]
    fn test_audio_only_stream() {
        let tracks = vec![aac_track()];
        let mut packager = TsPackager::new();
        let chunk = packager.push(&audio(0), &tracks).unwrap().unwrap();
        // PAT + PMT + at least one PES packet
        assert!(chunk.len() >= 3 * 188);
        assert!(packager.started());
    }

    #[test]
    fn test_unknown_codec_skipped() {
        let tracks = vec![video_track()];
        let mut packager = TsPackager::new();
        assert!(packager.write(&video(0, true), &tracks).unwrap());
        let opus = Frame::audio(CodecTag::Opus, 10, Bytes::from_static(&[1, 2]));
        assert!(!packager.write(&opus, &tracks).unwrap());
    }
}
