//! RTSP pull client: OPTIONS, DESCRIBE (Basic/Digest), SETUP per track over
//! TCP interleaved, PLAY, GET_PARAMETER keep-alive and TEARDOWN.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mediagate_media::{
    rtp::RtpPacket,
    rtsp::{
        auth::{strip_credentials, Challenge, Credentials},
        errors::{RtspError, RtspErrorValue},
        message::{RtspCodec, RtspItem, RtspRequest, RtspResponse, Transport},
        sdp::SessionDescription,
        DEFAULT_PORT,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::{rtp::RtpDemux, FrameSource, IngestAdapter, RtpTransport, SourceConfig};
use crate::{
    error::{GatewayError, Result},
    frame::{Frame, Protocol, TrackInfo},
};

const USER_AGENT: &str = concat!("mediagate/", env!("CARGO_PKG_VERSION"));
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

pub struct RtspIngest;

#[async_trait]
impl IngestAdapter for RtspIngest {
    fn protocol(&self) -> Protocol {
        Protocol::Rtsp
    }

    async fn connect(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
        let (url, credentials) = strip_credentials(&config.url);
        let parsed =
            url::Url::parse(&url).map_err(|e| GatewayError::InvalidInput(format!("bad rtsp url {url}: {e}")))?;
        if parsed.scheme() == "rtsps" {
            return Err(GatewayError::Unsupported("rtsps".to_string()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::InvalidInput(format!("rtsp url has no host: {url}")))?;
        let port = parsed.port().unwrap_or(DEFAULT_PORT);
        if config.transport != RtpTransport::Tcp {
            warn!(transport = ?config.transport, "Only TCP interleaved RTSP is supported, using TCP");
        }

        let io = TcpStream::connect((host, port))
            .await
            .map_err(|e| GatewayError::transport(format!("connect {host}:{port}: {e}")))?;
        let _ = io.set_nodelay(true);
        let session = RtspPlayer::start(io, url, credentials, config.enable_audio).await?;
        Ok(Box::new(session))
    }
}

/// Request side of an RTSP connection.
struct Client<S> {
    framed: Framed<S, RtspCodec>,
    cseq: u32,
    session: Option<String>,
    credentials: Option<Credentials>,
    challenge: Option<Challenge>,
    /// Interleaved data that arrived while waiting for a response.
    early: VecDeque<(u8, bytes::Bytes)>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn build(&mut self, method: &str, uri: &str) -> RtspRequest {
        self.cseq += 1;
        let mut request = RtspRequest::new(method, uri, self.cseq).header("User-Agent", USER_AGENT);
        if let Some(session) = &self.session {
            request = request.header("Session", session.clone());
        }
        if let (Some(challenge), Some(credentials)) = (&self.challenge, &self.credentials) {
            request = request.header("Authorization", challenge.authorization(credentials, method, uri));
        }
        request
    }

    async fn send(&mut self, request: RtspRequest) -> Result<()> {
        self.framed.send(RtspItem::Request(request)).await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<RtspResponse> {
        loop {
            match self.framed.next().await {
                Some(Ok(RtspItem::Response(response))) => return Ok(response),
                Some(Ok(RtspItem::Interleaved { channel, data })) => self.early.push_back((channel, data)),
                Some(Ok(RtspItem::Request(request))) => {
                    self.framed
                        .send(RtspItem::Response(RtspResponse::ok(request.headers.cseq())))
                        .await?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(RtspError::from(RtspErrorValue::Closed).into()),
            }
        }
    }

    /// Sends a request, answering one auth challenge if credentials exist.
    async fn call(&mut self, method: &str, uri: &str, extra: &[(&str, String)]) -> Result<RtspResponse> {
        let mut retried = false;
        loop {
            let mut request = self.build(method, uri);
            for (name, value) in extra {
                request = request.header(name, value.clone());
            }
            self.send(request).await?;
            let response = self.read_response().await?;
            match response.status {
                200..=299 => return Ok(response),
                401 if !retried && self.credentials.is_some() => {
                    let header = response
                        .headers
                        .get("WWW-Authenticate")
                        .ok_or(RtspErrorValue::MissingHeader("WWW-Authenticate"))
                        .map_err(RtspError::from)?;
                    self.challenge = Some(Challenge::parse(header)?);
                    retried = true;
                }
                401 => return Err(RtspError::from(RtspErrorValue::Unauthorized).into()),
                status => {
                    return Err(RtspError::from(RtspErrorValue::BadStatus {
                        method: method.to_string(),
                        status,
                        reason: response.reason,
                    })
                    .into())
                }
            }
        }
    }
}

fn session_timeout(header: Option<&str>) -> Duration {
    let secs = header
        .and_then(|v| v.split(';').find_map(|p| p.trim().strip_prefix("timeout=")))
        .and_then(|t| t.trim().parse::<u64>().ok())
        .filter(|t| *t > 0)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// A playing RTSP session.
pub struct RtspPlayer<S> {
    client: Client<S>,
    url: String,
    demux: RtpDemux,
    pending: VecDeque<Frame>,
    keepalive: Interval,
}

impl<S> RtspPlayer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the handshake up to PLAY on an established connection.
    pub async fn start(io: S, url: String, credentials: Option<Credentials>, enable_audio: bool) -> Result<Self> {
        let mut client = Client {
            framed: Framed::new(io, RtspCodec),
            cseq: 0,
            session: None,
            credentials,
            challenge: None,
            early: VecDeque::new(),
        };

        client.call("OPTIONS", &url, &[]).await?;
        let describe = client
            .call("DESCRIBE", &url, &[("Accept", "application/sdp".to_string())])
            .await?;
        let base = describe
            .headers
            .get("Content-Base")
            .or_else(|| describe.headers.get("Content-Location"))
            .map_or_else(|| url.clone(), str::to_string);
        let text = std::str::from_utf8(&describe.body)
            .map_err(|_| GatewayError::Protocol("sdp is not utf-8".to_string()))?;
        let sdp = SessionDescription::parse(text)?;
        let base = match sdp.control.as_deref() {
            Some(control) if control.starts_with("rtsp://") => control.to_string(),
            _ => base,
        };

        let mut demux = RtpDemux::new(enable_audio);
        let mut channel = 0u8;
        let mut timeout = Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS);
        let medias = sdp
            .video()
            .into_iter()
            .chain(sdp.audio().filter(|_| enable_audio));
        for media in medias {
            if !demux.add_media(media)? {
                debug!(encoding = %media.encoding, "Skipping unsupported track");
                continue;
            }
            let control = media.control_url(&base);
            let response = client
                .call("SETUP", &control, &[("Transport", Transport::interleaved(channel).to_header())])
                .await?;
            if client.session.is_none() {
                client.session = response.headers.session().map(str::to_string);
                timeout = session_timeout(response.headers.get("Session"));
            }
            channel = channel.wrapping_add(2);
        }
        if channel == 0 {
            return Err(GatewayError::Unsupported("no supported track in sdp".to_string()));
        }

        client.call("PLAY", &base, &[("Range", "npt=0.000-".to_string())]).await?;

        // GET_PARAMETER at half the session timeout
        let period = timeout / 2;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            client,
            url: base,
            demux,
            pending: VecDeque::new(),
            keepalive,
        })
    }

    fn on_interleaved(&mut self, channel: u8, data: bytes::Bytes) -> Result<()> {
        // odd channels carry RTCP
        if channel % 2 == 1 {
            return Ok(());
        }
        let packet = RtpPacket::parse(data)?;
        let mut out = Vec::new();
        let result = self.demux.push(&packet, &mut out);
        self.pending.extend(out);
        result
    }
}

#[async_trait]
impl<S> FrameSource for RtspPlayer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn tracks(&self) -> Vec<TrackInfo> {
        self.demux.tracks()
    }

    fn take_track_update(&mut self) -> Option<Vec<TrackInfo>> {
        self.demux.take_update()
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some((channel, data)) = self.client.early.pop_front() {
                self.on_interleaved(channel, data)?;
                continue;
            }
            tokio::select! {
                _ = self.keepalive.tick() => {
                    let request = self.client.build("GET_PARAMETER", &self.url);
                    self.client.send(request).await?;
                }
                item = self.client.framed.next() => match item {
                    Some(Ok(RtspItem::Interleaved { channel, data })) => self.on_interleaved(channel, data)?,
                    Some(Ok(RtspItem::Response(response))) => {
                        if response.status >= 400 {
                            debug!(status = response.status, "Keep-alive rejected");
                        }
                    }
                    Some(Ok(RtspItem::Request(request))) => {
                        self.client
                            .framed
                            .send(RtspItem::Response(RtspResponse::ok(request.headers.cseq())))
                            .await?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(None),
                },
            }
        }
    }

    async fn close(&mut self) {
        let request = self.client.build("TEARDOWN", &self.url);
        if let Err(e) = self.client.send(request).await {
            debug!(error = %e, "TEARDOWN not delivered");
        }
    }
}
