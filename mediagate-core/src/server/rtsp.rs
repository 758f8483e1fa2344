//! RTSP listener serving `rtsp://host/{app}/{stream}` to players over TCP
//! interleaved RTP.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use mediagate_media::rtsp::message::{RtspCodec, RtspItem, RtspRequest, RtspResponse, Transport};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info};

use super::{spawn_accept_loop, stream_key_from_path};
use crate::{
    error::{GatewayError, Result},
    frame::{Protocol, StreamKey},
    output::{rtsp::RtspPackager, FrameConsumer, OutputSession},
    session::SessionManager,
};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER";
const SESSION_TIMEOUT_SECS: u64 = 60;

pub struct RtspServer {
    session: Arc<SessionManager>,
}

impl RtspServer {
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn spawn(self, listener: TcpListener, cancel: CancellationToken) -> JoinHandle<()> {
        let session = self.session;
        spawn_accept_loop("RTSP", listener, cancel, move |socket, peer| {
            let local_ip = socket.local_addr().map_or_else(|_| "0.0.0.0".to_string(), |a| a.ip().to_string());
            let connection = RtspConnection::new(Arc::clone(&session), socket, peer, local_ip);
            connection.run()
        })
    }
}

fn status_for(err: &GatewayError) -> u16 {
    match err {
        GatewayError::NotFound(_) => 404,
        GatewayError::InvalidInput(_) => 400,
        GatewayError::Unsupported(_) => 415,
        GatewayError::Busy(_) | GatewayError::Transport(_) => 503,
        _ => 500,
    }
}

/// Player state between DESCRIBE and PLAY.
struct Described {
    key: StreamKey,
    consumer: FrameConsumer,
    packager: RtspPackager,
}

/// What the request loop should do after answering.
enum Next {
    Continue,
    Play,
    Close,
}

pub struct RtspConnection<S> {
    session: Arc<SessionManager>,
    framed: Framed<S, RtspCodec>,
    peer: SocketAddr,
    local_ip: String,
    session_id: String,
    described: Option<Described>,
}

impl<S> RtspConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(session: Arc<SessionManager>, io: S, peer: SocketAddr, local_ip: String) -> Self {
        Self {
            session,
            framed: Framed::new(io, RtspCodec),
            peer,
            local_ip,
            session_id: nanoid::nanoid!(12),
            described: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        if let Some(described) = self.described.take() {
            debug!(stream = %described.key, consumer = described.consumer.id(), "RTSP player detached");
            described.consumer.detach();
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let request = match self.framed.next().await {
                Some(Ok(RtspItem::Request(request))) => request,
                // RTCP receiver reports and stray responses
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            };
            match self.answer(&request).await? {
                Next::Continue => {}
                Next::Close => return Ok(()),
                Next::Play => return self.play().await,
            }
        }
    }

    async fn answer(&mut self, request: &RtspRequest) -> Result<Next> {
        let cseq = request.headers.cseq();
        let outcome = match request.method.as_str() {
            "OPTIONS" | "GET_PARAMETER" | "SET_PARAMETER" => {
                Ok((RtspResponse::ok(cseq).header("Public", PUBLIC_METHODS), Next::Continue))
            }
            "DESCRIBE" => self.describe(request).await.map(|r| (r, Next::Continue)),
            "SETUP" => self.setup(request).map(|r| (r, Next::Continue)),
            "PLAY" => self.start_play(request),
            "TEARDOWN" => Ok((self.with_session(RtspResponse::ok(cseq)), Next::Close)),
            _ => Ok((RtspResponse::new(501, cseq), Next::Continue)),
        };
        let (response, next) = match outcome {
            Ok(answered) => answered,
            Err(e) => {
                debug!(method = %request.method, uri = %request.uri, error = %e, "RTSP request refused");
                let close = self.described.is_none() && request.method == "DESCRIBE";
                let response = RtspResponse::new(status_for(&e), cseq);
                self.framed.send(RtspItem::Response(response)).await?;
                // a failed DESCRIBE leaves nothing to play
                return Ok(if close { Next::Close } else { Next::Continue });
            }
        };
        self.framed.send(RtspItem::Response(response)).await?;
        Ok(next)
    }

    fn with_session(&self, response: RtspResponse) -> RtspResponse {
        response.header("Session", format!("{};timeout={SESSION_TIMEOUT_SECS}", self.session_id))
    }

    fn base_url(uri: &str) -> &str {
        uri.split('?').next().unwrap_or(uri).trim_end_matches('/')
    }

    async fn describe(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let key = stream_key_from_path(url_path(&request.uri))?;
        if let Some(previous) = self.described.take() {
            previous.consumer.detach();
        }
        let consumer = match self.session.attach_default(&key, Protocol::Rtsp).await? {
            OutputSession::Frames(consumer) => consumer,
            _ => return Err(GatewayError::Internal("rtsp output returned a non-frame session".to_string())),
        };
        let packager = RtspPackager::new(&consumer.tracks());
        if packager.is_empty() {
            consumer.detach();
            return Err(GatewayError::Unsupported(format!("{key} has no track RTP can carry")));
        }
        let sdp = packager.sdp(&key.to_string(), &self.local_ip);
        info!(stream = %key, peer = %self.peer, "RTSP player described");
        self.described = Some(Described { key, consumer, packager });
        Ok(RtspResponse::ok(request.headers.cseq())
            .header("Content-Base", format!("{}/", Self::base_url(&request.uri)))
            .body("application/sdp", sdp))
    }

    fn setup(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let cseq = request.headers.cseq();
        let Some(described) = self.described.as_mut() else {
            return Ok(RtspResponse::new(455, cseq));
        };
        let transport = Transport::parse(request.headers.get("Transport").unwrap_or_default());
        if !transport.tcp || transport.multicast {
            return Ok(RtspResponse::new(461, cseq));
        }
        let channel = transport.interleaved.map_or(0, |(rtp, _)| rtp);
        described.packager.setup(&request.uri, channel)?;
        Ok(self.with_session(RtspResponse::ok(cseq).header("Transport", Transport::interleaved(channel).to_header())))
    }

    fn start_play(&self, request: &RtspRequest) -> Result<(RtspResponse, Next)> {
        let cseq = request.headers.cseq();
        let Some(described) = self.described.as_ref().filter(|d| d.packager.is_setup()) else {
            return Ok((RtspResponse::new(455, cseq), Next::Continue));
        };
        if request.headers.session().is_some_and(|s| s != self.session_id) {
            return Ok((RtspResponse::new(454, cseq), Next::Continue));
        }
        let response = self
            .with_session(RtspResponse::ok(cseq))
            .header("Range", "npt=0.000-")
            .header("RTP-Info", described.packager.rtp_info(Self::base_url(&request.uri)));
        Ok((response, Next::Play))
    }

    /// Streams interleaved RTP while still answering keep-alives, until
    /// TEARDOWN, disconnect or the end of the stream.
    async fn play(&mut self) -> Result<()> {
        let Some(described) = self.described.as_mut() else {
            return Ok(());
        };
        info!(stream = %described.key, peer = %self.peer, "RTSP player started");
        let mut sent: u64 = 0;
        loop {
            tokio::select! {
                item = self.framed.next() => match item {
                    Some(Ok(RtspItem::Request(request))) => {
                        let cseq = request.headers.cseq();
                        let teardown = request.method == "TEARDOWN";
                        let response = RtspResponse::ok(cseq)
                            .header("Session", format!("{};timeout={SESSION_TIMEOUT_SECS}", self.session_id));
                        self.framed.send(RtspItem::Response(response)).await?;
                        if teardown {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
                frame = described.consumer.recv() => match frame? {
                    Some(frame) => {
                        for (channel, data) in described.packager.packets(&frame) {
                            self.framed.feed(RtspItem::Interleaved { channel, data }).await?;
                            sent += 1;
                        }
                        self.framed.flush().await?;
                    }
                    None => break,
                },
            }
        }
        debug!(stream = %described.key, sent, resyncs = described.consumer.resyncs(), "RTSP player finished");
        Ok(())
    }
}

/// Path part of an absolute or relative RTSP url.
fn url_path(uri: &str) -> &str {
    match uri.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => uri,
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use super::*;
    use crate::{
        config::Config,
        ingest::{rtsp::RtspPlayer, tests::ScriptedSource, FrameSource},
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

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("rtsp://10.0.0.1:554/live/cam1/track0"), "/live/cam1/track0");
        assert_eq!(url_path("rtsp://10.0.0.1"), "");
        assert_eq!(url_path("/live/cam1"), "/live/cam1");
    }

    #[tokio::test]
    async fn test_player_receives_rtp() {
        let dir = tempfile::tempdir().unwrap();
        let session = manager(dir.path());
        let key = StreamKey::new("live", "cam1").unwrap();
        let items: VecDeque<_> = [(0, true), (40, false)].into_iter().map(|(ts, k)| Ok(Some(video(ts, k)))).collect();
        let stream = session
            .on_publish(&key, Protocol::Rtmp, "test".to_string(), Box::new(ScriptedSource { items }))
            .unwrap();
        for _ in 0..100 {
            if stream.bus().stats().frames >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stream.bus().set_tracks(vec![video_track()]);

        let (client, server) = tokio::io::duplex(256 * 1024);
        let connection = RtspConnection::new(Arc::clone(&session), server, peer(), "127.0.0.1".to_string());
        let task = tokio::spawn(connection.run());

        let mut player = RtspPlayer::start(client, "rtsp://127.0.0.1/live/cam1".to_string(), None, false)
            .await
            .unwrap();
        assert_eq!(stream.bus().consumers().get(&Protocol::Rtsp), Some(&1));

        // the replayed GOP only completes once the next access unit arrives
        stream.bus().publish(video(80, true));
        let first = tokio::time::timeout(Duration::from_secs(5), player.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(first.keyframe);

        player.close().await;
        task.await.unwrap().unwrap();
        drop(player);
        assert_eq!(stream.bus().consumers().get(&Protocol::Rtsp).copied().unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_describe_unknown_stream_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let session = manager(dir.path());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(RtspConnection::new(session, server, peer(), "127.0.0.1".to_string()).run());

        let mut framed = Framed::new(client, RtspCodec);
        let request = RtspRequest::new("DESCRIBE", "rtsp://127.0.0.1/live/missing", 2);
        framed.send(RtspItem::Request(request)).await.unwrap();
        match framed.next().await.unwrap().unwrap() {
            RtspItem::Response(response) => {
                assert_eq!(response.status, 404);
                assert_eq!(response.headers.cseq(), Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_play_before_setup_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let session = manager(dir.path());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(RtspConnection::new(session, server, peer(), "127.0.0.1".to_string()).run());

        let mut framed = Framed::new(client, RtspCodec);
        for (cseq, method) in [(1, "OPTIONS"), (2, "PLAY")] {
            framed
                .send(RtspItem::Request(RtspRequest::new(method, "rtsp://127.0.0.1/live/cam1", cseq)))
                .await
                .unwrap();
        }
        let mut statuses = Vec::new();
        for _ in 0..2 {
            if let RtspItem::Response(response) = framed.next().await.unwrap().unwrap() {
                statuses.push(response.status);
            }
        }
        assert_eq!(statuses, vec![200, 455]);
        drop(framed);
        task.await.unwrap().unwrap();
    }
}
