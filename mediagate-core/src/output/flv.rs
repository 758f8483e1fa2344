//! FLV tags from frames, for HTTP-FLV and RTMP play.

use async_trait::async_trait;
use bytes::Bytes;
use mediagate_media::flv::{
    define::tag_type,
    muxer::{aac_raw_body, avc_nalu_body, g711_body, FlvMuxer},
};
use tracing::debug;

use super::{spawn_body, AttachOptions, FrameConsumer, OutputAdapter, OutputSession, Packager};
use crate::{
    error::Result,
    frame::{CodecTag, Frame, Protocol, TrackInfo, TrackKind},
    ingest::flv::sequence_headers,
    registry::StreamHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: u8,
    /// Milliseconds from the first frame this client saw.
    pub timestamp: u32,
    pub body: Bytes,
}

/// Frame to tag conversion with timestamps rebased to zero and sequence
/// headers re-sent whenever the codec configuration changes.
#[derive(Debug, Default)]
pub struct FlvTagger {
    origin: Option<i64>,
    video_header: Option<Bytes>,
    audio_header: Option<Bytes>,
    skipped_codecs: Vec<CodecTag>,
}

impl FlvTagger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn timestamp(&mut self, dts_ms: i64) -> u32 {
        let origin = *self.origin.get_or_insert(dts_ms);
        u32::try_from((dts_ms - origin).max(0)).unwrap_or(u32::MAX)
    }

    /// Tags for one frame, preceded by any new sequence header.
    pub fn tags(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Vec<FlvTag> {
        let mut out = Vec::with_capacity(2);
        let timestamp = self.timestamp(frame.dts_ms);

        if frame.keyframe {
            let (video, audio) = sequence_headers(tracks);
            if frame.kind == TrackKind::Video && video.is_some() && video != self.video_header {
                self.video_header.clone_from(&video);
                out.extend(video.map(|body| FlvTag {
                    tag_type: tag_type::VIDEO,
                    timestamp,
                    body,
                }));
            }
            if audio.is_some() && audio != self.audio_header {
                self.audio_header.clone_from(&audio);
                out.extend(audio.map(|body| FlvTag {
                    tag_type: tag_type::AUDIO,
                    timestamp,
                    body,
                }));
            }
        }

        let body = match frame.codec {
            CodecTag::H264 => {
                let cts = i32::try_from(frame.pts_ms - frame.dts_ms).unwrap_or(0);
                Some((tag_type::VIDEO, avc_nalu_body(frame.keyframe, cts, &frame.payload)))
            }
            CodecTag::Aac if self.audio_header.is_some() => Some((tag_type::AUDIO, aac_raw_body(&frame.payload))),
            CodecTag::G711A => Some((tag_type::AUDIO, g711_body(true, &frame.payload))),
            CodecTag::G711U => Some((tag_type::AUDIO, g711_body(false, &frame.payload))),
            codec => {
                if !self.skipped_codecs.contains(&codec) {
                    debug!(?codec, "Codec not carried over FLV, skipping its frames");
                    self.skipped_codecs.push(codec);
                }
                None
            }
        };
        out.extend(body.map(|(tag_type, body)| FlvTag {
            tag_type,
            timestamp,
            body: body.freeze(),
        }));
        out
    }
}

/// FLV file framing over [`FlvTagger`].
pub struct FlvPackager {
    tagger: FlvTagger,
    muxer: FlvMuxer,
    header_written: bool,
}

impl FlvPackager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tagger: FlvTagger::new(),
            muxer: FlvMuxer::new(),
            header_written: false,
        }
    }
}

impl Default for FlvPackager {
    fn default() -> Self {
        Self::new()
    }
}

impl Packager for FlvPackager {
    fn push(&mut self, frame: &Frame, tracks: &[TrackInfo]) -> Result<Option<Bytes>> {
        if !self.header_written {
            let has_audio = tracks.iter().any(|t| t.kind == TrackKind::Audio);
            let has_video = tracks.iter().any(|t| t.kind == TrackKind::Video) || frame.is_video();
            self.muxer.write_flv_header(has_audio, has_video)?;
            self.header_written = true;
        }
        for tag in self.tagger.tags(frame, tracks) {
            self.muxer.write_tag(tag.tag_type, tag.timestamp, &tag.body)?;
        }
        let out = self.muxer.extract();
        Ok((!out.is_empty()).then(|| out.freeze()))
    }
}

pub struct FlvOutput;

#[async_trait]
impl OutputAdapter for FlvOutput {
    fn protocol(&self) -> Protocol {
        Protocol::Flv
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        let consumer = FrameConsumer::attach(stream, Protocol::Flv, &options)?;
        Ok(OutputSession::Body(spawn_body(consumer, FlvPackager::new(), "video/x-flv")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ingest::{http_flv::FlvByteSource, FrameSource},
        output::tests::{aac_track, audio, video, video_track},
    };
    use futures::StreamExt;

    #[test]
    fn test_tags_rebase_and_headers() {
        let tracks = vec![video_track(), aac_track()];
        let mut tagger = FlvTagger::new();

        let first = tagger.tags(&video(5000, true), &tracks);
        // avc header, aac header, frame
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|t| t.timestamp == 0));
        assert_eq!(first[2].tag_type, tag_type::VIDEO);

        let next = tagger.tags(&audio(5023), &tracks);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].timestamp, 23);

        // unchanged configuration is not re-sent on the next keyframe
        assert_eq!(tagger.tags(&video(7000, true), &tracks).len(), 1);
        let h265 = Frame::video(CodecTag::H265, 7040, 7040, false, Bytes::from_static(&[1]));
        assert!(tagger.tags(&h265, &tracks).is_empty());
    }

    #[tokio::test]
    async fn test_packaged_stream_reads_back() {
        let tracks = vec![video_track(), aac_track()];
        let mut packager = FlvPackager::new();
        let mut chunks = Vec::new();
        for frame in [video(1000, true), audio(1010), video(1040, false)] {
            chunks.extend(packager.push(&frame, &tracks).unwrap());
        }
        let body = futures::stream::iter(chunks.into_iter().map(Ok)).boxed();
        let mut source = FlvByteSource::new(body, true);

        let first = source.next_frame().await.unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.dts_ms, 0);
        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!((second.codec, second.pts_ms), (CodecTag::Aac, 10));
        let third = source.next_frame().await.unwrap().unwrap();
        assert_eq!(third.dts_ms, 40);
        assert_eq!(source.tracks().len(), 2);
    }
}
