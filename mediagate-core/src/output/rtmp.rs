//! RTMP play: frames to FLV tag bodies on an accepted player connection.

use async_trait::async_trait;
use mediagate_media::{
    flv::define::tag_type,
    rtmp::connection::{MediaMessage, RtmpConnection},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{flv::FlvTagger, AttachOptions, FrameConsumer, OutputAdapter, OutputSession};
use crate::{
    error::Result,
    frame::Protocol,
    registry::StreamHandle,
};

/// Hands the listener a consumer; the connection task drives [`play`].
pub struct RtmpOutput;

#[async_trait]
impl OutputAdapter for RtmpOutput {
    fn protocol(&self) -> Protocol {
        Protocol::Rtmp
    }

    async fn attach(&self, stream: &StreamHandle, options: AttachOptions) -> Result<OutputSession> {
        Ok(OutputSession::Frames(FrameConsumer::attach(stream, Protocol::Rtmp, &options)?))
    }
}

/// Streams to a player until the stream ends or a write fails. The player
/// gets a stream EOF when the stream ends.
pub async fn play<S>(conn: &mut RtmpConnection<S>, mut consumer: FrameConsumer) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut tagger = FlvTagger::new();
    let mut tracks = consumer.tracks();
    let mut sent: u64 = 0;

    let result = loop {
        let frame = match consumer.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                conn.send_eof().await?;
                break Ok(());
            }
            Err(e) => break Err(e),
        };
        if frame.keyframe && frame.is_video() {
            tracks = consumer.tracks();
        }
        for tag in tagger.tags(&frame, &tracks) {
            let media = if tag.tag_type == tag_type::VIDEO {
                MediaMessage::Video {
                    timestamp: tag.timestamp,
                    data: tag.body,
                }
            } else {
                MediaMessage::Audio {
                    timestamp: tag.timestamp,
                    data: tag.body,
                }
            };
            conn.send_media(media).await?;
            sent += 1;
        }
    };

    debug!(consumer = consumer.id(), sent, resyncs = consumer.resyncs(), "RTMP player finished");
    consumer.detach();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ingest::{rtmp::RtmpSource, FrameSource},
        output::tests::{audio, stream, video},
    };
    use mediagate_media::rtmp::{address::RtmpAddress, connection::ServerRequest};

    #[tokio::test]
    async fn test_player_receives_rebased_frames_then_eof() {
        let stream = stream("cam1");
        let consumer = match RtmpOutput.attach(&stream, AttachOptions::new(64)).await.unwrap() {
            OutputSession::Frames(consumer) => consumer,
            other => panic!("unexpected {other:?}"),
        };
        stream.bus().publish(video(9000, true));
        stream.bus().publish(audio(9010));
        stream.bus().publish(video(9040, false));
        stream.close();

        let (client, server) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(async move {
            let (mut conn, request) = RtmpConnection::accept(server).await.unwrap();
            assert!(matches!(request, ServerRequest::Play { .. }));
            play(&mut conn, consumer).await.unwrap();
            conn
        });

        let address = RtmpAddress::parse("rtmp://127.0.0.1/live/cam1").unwrap();
        let conn = RtmpConnection::connect_play(client, &address).await.unwrap();
        let mut source = RtmpSource::new(conn, true);
        let first = source.next_frame().await.unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.dts_ms, 0);
        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.pts_ms, 10);
        let third = source.next_frame().await.unwrap().unwrap();
        assert_eq!(third.dts_ms, 40);
        assert!(source.next_frame().await.unwrap().is_none());
        drop(server.await.unwrap());
    }
}
