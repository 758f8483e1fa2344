use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use mediagate_media::flv::{
    define::tag_type,
    demuxer::{FlvTag, FlvTagReader},
};

use super::{flv::FlvAssembler, FrameSource, IngestAdapter, SourceConfig};
use crate::{
    error::{GatewayError, Result},
    frame::{Frame, Protocol, TrackInfo},
};

/// Pulls an HTTP(S)-FLV live stream.
pub struct HttpFlvIngest {
    client: reqwest::Client,
}

impl HttpFlvIngest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFlvIngest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestAdapter for HttpFlvIngest {
    fn protocol(&self) -> Protocol {
        Protocol::Flv
    }

    async fn connect(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
        let response = self.client.get(&config.url).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "GET {} returned {}",
                config.url,
                response.status()
            )));
        }
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from))
            .boxed();
        Ok(Box::new(FlvByteSource::new(body, config.enable_audio)))
    }
}

/// Frames from any FLV byte stream.
pub struct FlvByteSource {
    body: BoxStream<'static, Result<Bytes>>,
    reader: FlvTagReader,
    assembler: FlvAssembler,
}

impl FlvByteSource {
    #[must_use]
    pub fn new(body: BoxStream<'static, Result<Bytes>>, enable_audio: bool) -> Self {
        Self {
            body,
            reader: FlvTagReader::new(),
            assembler: FlvAssembler::new(enable_audio),
        }
    }

    fn frame_from(&mut self, tag: &FlvTag) -> Result<Option<Frame>> {
        match tag.tag_type {
            tag_type::VIDEO => self.assembler.video(tag.timestamp, &tag.data),
            tag_type::AUDIO => self.assembler.audio(tag.timestamp, &tag.data),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl FrameSource for FlvByteSource {
    fn tracks(&self) -> Vec<TrackInfo> {
        self.assembler.tracks()
    }

    fn take_track_update(&mut self) -> Option<Vec<TrackInfo>> {
        self.assembler.take_update()
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            // a framing error leaves the reader desynchronized for good
            while let Some(tag) = self
                .reader
                .next_tag()
                .map_err(|e| GatewayError::Transport(format!("flv stream desynchronized: {e}")))?
            {
                if let Some(frame) = self.frame_from(&tag)? {
                    return Ok(Some(frame));
                }
            }
            match self.body.next().await {
                Some(chunk) => self.reader.extend(&chunk?),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediagate_media::{
        flv::muxer::{avc_nalu_body, avc_sequence_header_body, FlvMuxer},
        h264::config::AvcDecoderConfigurationRecord,
    };

    #[tokio::test]
    async fn test_frames_across_chunk_boundaries() {
        let record = AvcDecoderConfigurationRecord::from_parameter_sets(
            Bytes::from_static(&[0x67, 0x42, 0x00, 0x1F]),
            Bytes::from_static(&[0x68, 0xCE]),
        )
        .unwrap();
        let mut muxer = FlvMuxer::new();
        muxer.write_flv_header(false, true).unwrap();
        muxer
            .write_tag(tag_type::VIDEO, 0, &avc_sequence_header_body(&record).unwrap())
            .unwrap();
        muxer
            .write_tag(tag_type::VIDEO, 0, &avc_nalu_body(true, 0, &[0, 0, 0, 1, 0x65, 1]))
            .unwrap();
        muxer
            .write_tag(tag_type::VIDEO, 40, &avc_nalu_body(false, 0, &[0, 0, 0, 1, 0x41, 2]))
            .unwrap();
        let bytes = muxer.extract().freeze();

        // deliver in 7 byte chunks
        let chunks: Vec<Result<Bytes>> = bytes.chunks(7).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        let mut source = FlvByteSource::new(futures::stream::iter(chunks).boxed(), true);

        let first = source.next_frame().await.unwrap().unwrap();
        assert!(first.keyframe);
        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.dts_ms, 40);
        assert!(!second.keyframe);
        assert!(source.next_frame().await.unwrap().is_none());
        assert_eq!(source.tracks().len(), 1);
    }
}
