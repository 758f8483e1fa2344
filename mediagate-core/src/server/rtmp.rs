//! RTMP listener: `rtmp://host/{app}/{stream}` for both publishers and
//! players.

use std::{net::SocketAddr, sync::Arc};

use mediagate_media::rtmp::connection::{RtmpConnection, ServerRequest};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::spawn_accept_loop;
use crate::{
    error::{GatewayError, Result},
    frame::{Protocol, StreamKey},
    ingest::rtmp::RtmpSource,
    output::{self, OutputSession},
    session::SessionManager,
};

pub struct RtmpServer {
    session: Arc<SessionManager>,
}

impl RtmpServer {
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn spawn(self, listener: TcpListener, cancel: CancellationToken) -> JoinHandle<()> {
        let session = self.session;
        spawn_accept_loop("RTMP", listener, cancel, move |socket, peer| {
            handle_connection(Arc::clone(&session), socket, peer)
        })
    }
}

/// Runs one connection. A publisher's connection is handed to the ingest
/// task and this returns right away; a player is served until it leaves.
pub async fn handle_connection<S>(session: Arc<SessionManager>, io: S, peer: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut conn, request) = RtmpConnection::accept(io).await?;
    let key = StreamKey::new(request.app(), request.stream())?;

    match request {
        ServerRequest::Publish { .. } => {
            let source = RtmpSource::new(conn, true);
            session.on_publish(&key, Protocol::Rtmp, format!("rtmp://{peer}"), Box::new(source))?;
            info!(stream = %key, %peer, "RTMP publisher accepted");
            Ok(())
        }
        ServerRequest::Play { .. } => {
            let consumer = match session.attach_default(&key, Protocol::Rtmp).await? {
                OutputSession::Frames(consumer) => consumer,
                _ => return Err(GatewayError::Internal("rtmp output returned a non-frame session".to_string())),
            };
            info!(stream = %key, %peer, consumer = consumer.id(), "RTMP player attached");
            output::rtmp::play(&mut conn, consumer).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use mediagate_media::rtmp::address::RtmpAddress;
    use tokio::net::TcpStream;

    use super::*;
    use crate::{
        config::Config,
        ingest::{tests::ScriptedSource, FrameSource},
        output::{
            tests::{video, video_track},
            OutputRegistry,
        },
        recording::{PolicyStore, RecordingEngine},
        registry::Registry,
        session::ProxyStore,
        storage::{MemoryStorage, SegmentStorage},
    };

    fn manager(root: &std::path::Path) -> Arc<SessionManager> {
        let mut config = Config::default();
        config.recording.root = root.display().to_string();
        let policies = Arc::new(PolicyStore::new(config.recording.default_policy));
        let registry = Registry::init(1, Arc::clone(&policies));
        let storage: Arc<dyn SegmentStorage> = Arc::new(MemoryStorage::new());
        let outputs = Arc::new(OutputRegistry::new(&config.streaming, Arc::clone(&storage)));
        let recording = RecordingEngine::new(&config.recording, 256, policies);
        SessionManager::new(&config, registry, outputs, recording, Arc::new(ProxyStore::in_memory()), storage)
    }

    #[tokio::test]
    async fn test_player_gets_published_stream() {
        let dir = tempfile::tempdir().unwrap();
        let session = manager(dir.path());
        let items: VecDeque<_> = [(0, true), (40, false), (80, false)]
            .into_iter()
            .map(|(ts, key)| Ok(Some(video(ts, key))))
            .collect();
        let key = StreamKey::new("live", "cam1").unwrap();
        let stream = session
            .on_publish(&key, Protocol::Rtmp, "test".to_string(), Box::new(ScriptedSource { items }))
            .unwrap();
        for _ in 0..100 {
            if stream.bus().stats().frames >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stream.bus().set_tracks(vec![video_track()]);

        let listener = super::super::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = RtmpServer::new(Arc::clone(&session)).spawn(listener, cancel.clone());

        let socket = TcpStream::connect(addr).await.unwrap();
        let address = RtmpAddress::parse(&format!("rtmp://{addr}/live/cam1")).unwrap();
        let conn = RtmpConnection::connect_play(socket, &address).await.unwrap();
        let mut player = RtmpSource::new(conn, true);
        let first = tokio::time::timeout(Duration::from_secs(5), player.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(first.keyframe);

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_play_of_unknown_stream_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let session = manager(dir.path());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let task = tokio::spawn(handle_connection(session, server, peer));

        let address = RtmpAddress::parse("rtmp://127.0.0.1/live/missing").unwrap();
        let _conn = RtmpConnection::connect_play(client, &address).await;
        assert!(matches!(task.await.unwrap(), Err(GatewayError::NotFound(_))));
    }
}
