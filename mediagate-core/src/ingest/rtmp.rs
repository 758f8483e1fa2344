use async_trait::async_trait;
use mediagate_media::rtmp::{
    address::RtmpAddress,
    connection::{MediaMessage, RtmpConnection},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::debug;

use super::{flv::FlvAssembler, FrameSource, IngestAdapter, SourceConfig};
use crate::{
    error::{GatewayError, Result},
    frame::{Frame, Protocol, TrackInfo},
};

/// Pulls `rtmp://host[:port]/app/stream` as a player.
pub struct RtmpIngest;

#[async_trait]
impl IngestAdapter for RtmpIngest {
    fn protocol(&self) -> Protocol {
        Protocol::Rtmp
    }

    async fn connect(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
        let address = RtmpAddress::parse(&config.url)?;
        let io = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| GatewayError::transport(format!("connect {}:{}: {e}", address.host, address.port)))?;
        let _ = io.set_nodelay(true);
        let conn = RtmpConnection::connect_play(io, &address).await?;
        debug!(app = %address.app, stream = %address.stream, "RTMP play started");
        Ok(Box::new(RtmpSource::new(conn, config.enable_audio)))
    }
}

/// Frames from an established RTMP connection, either a pulled stream or
/// an accepted publisher.
pub struct RtmpSource<S> {
    conn: RtmpConnection<S>,
    assembler: FlvAssembler,
}

impl<S> RtmpSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub const fn new(conn: RtmpConnection<S>, enable_audio: bool) -> Self {
        Self {
            conn,
            assembler: FlvAssembler::new(enable_audio),
        }
    }
}

#[async_trait]
impl<S> FrameSource for RtmpSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn tracks(&self) -> Vec<TrackInfo> {
        self.assembler.tracks()
    }

    fn take_track_update(&mut self) -> Option<Vec<TrackInfo>> {
        self.assembler.take_update()
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let frame = match self.conn.read_media().await? {
                None => return Ok(None),
                Some(MediaMessage::Video { timestamp, data }) => self.assembler.video(timestamp, &data)?,
                Some(MediaMessage::Audio { timestamp, data }) => self.assembler.audio(timestamp, &data)?,
                Some(MediaMessage::Metadata(_)) => None,
            };
            if let Some(frame) = frame {
                return Ok(Some(frame));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mediagate_media::{
        flv::muxer::{avc_nalu_body, avc_sequence_header_body},
        h264::config::AvcDecoderConfigurationRecord,
        rtmp::connection::ServerRequest,
    };

    #[tokio::test]
    async fn test_play_receives_frames_after_sequence_header() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let publisher = tokio::spawn(async move {
            let (mut conn, request) = RtmpConnection::accept(server).await.unwrap();
            assert!(matches!(request, ServerRequest::Play { .. }));
            let record = AvcDecoderConfigurationRecord::from_parameter_sets(
                Bytes::from_static(&[0x67, 0x42, 0x00, 0x1F]),
                Bytes::from_static(&[0x68, 0xCE]),
            )
            .unwrap();
            let header = avc_sequence_header_body(&record).unwrap().freeze();
            conn.send_media(MediaMessage::Video {
                timestamp: 0,
                data: header,
            })
            .await
            .unwrap();
            let body = avc_nalu_body(true, 0, &[0, 0, 0, 1, 0x65, 0x01]).freeze();
            conn.send_media(MediaMessage::Video {
                timestamp: 40,
                data: body,
            })
            .await
            .unwrap();
            conn.send_eof().await.unwrap();
            conn
        });

        let address = RtmpAddress::parse("rtmp://127.0.0.1/live/cam1").unwrap();
        let conn = RtmpConnection::connect_play(client, &address).await.unwrap();
        let mut source = RtmpSource::new(conn, true);

        let frame = source.next_frame().await.unwrap().unwrap();
        assert!(frame.keyframe);
        assert_eq!(frame.dts_ms, 40);
        assert_eq!(source.take_track_update().unwrap().len(), 1);
        assert!(source.next_frame().await.unwrap().is_none());
        drop(publisher.await.unwrap());
    }
}
