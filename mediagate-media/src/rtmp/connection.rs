use {
    super::{
        address::{split_stream_name, RtmpAddress},
        chunk::ChunkCodec,
        errors::{RtmpError, RtmpErrorValue},
        handshake::{client_handshake, server_handshake},
        message::{msg_type, user_control, Command, RtmpMessage, DEFAULT_WINDOW_ACK_SIZE},
    },
    crate::amf0::Amf0Value,
    byteorder::{BigEndian, ByteOrder},
    bytes::Bytes,
    futures::{SinkExt, StreamExt},
    std::collections::VecDeque,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_util::codec::Framed,
};

const OUT_CHUNK_SIZE: u32 = 4096;
const PUBLISH_STREAM_ID: u32 = 1;

/// What a remote peer asked for after `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    Publish {
        app: String,
        stream: String,
        query: Option<String>,
    },
    Play {
        app: String,
        stream: String,
        query: Option<String>,
    },
}

impl ServerRequest {
    #[must_use]
    pub fn app(&self) -> &str {
        match self {
            Self::Publish { app, .. } | Self::Play { app, .. } => app,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        match self {
            Self::Publish { stream, .. } | Self::Play { stream, .. } => stream,
        }
    }
}

/// Media carried by an established connection. Audio and video payloads are
/// FLV tag bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaMessage {
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
    Metadata(Vec<Amf0Value>),
}

pub struct RtmpConnection<S> {
    framed: Framed<S, ChunkCodec>,
    stream_id: u32,
    peer_window: u32,
    acked: u64,
    pending: VecDeque<MediaMessage>,
}

fn status_object(level: &str, code: &str, description: &str) -> Amf0Value {
    Amf0Value::object([
        ("level", level.into()),
        ("code", code.into()),
        ("description", description.into()),
    ])
}

impl<S> RtmpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(io: S) -> Self {
        Self {
            framed: Framed::new(io, ChunkCodec::new()),
            stream_id: 0,
            peer_window: 0,
            acked: 0,
            pending: VecDeque::new(),
        }
    }

    /// Runs the server side of a connection up to `publish` or `play`.
    pub async fn accept(mut io: S) -> Result<(Self, ServerRequest), RtmpError> {
        server_handshake(&mut io).await?;
        let mut conn = Self::new(io);
        let mut app: Option<String> = None;

        loop {
            let msg = conn.next_message().await?.ok_or(RtmpErrorValue::Closed)?;
            if conn.handle_control(&msg).await? {
                continue;
            }
            let Some(cmd) = msg.parse_command()? else {
                continue;
            };
            match cmd.name.as_str() {
                "connect" => {
                    app = cmd
                        .object
                        .get("app")
                        .and_then(Amf0Value::as_str)
                        .map(|app| app.trim_matches('/').to_string())
                        .filter(|app| !app.is_empty());
                    conn.reply_connect(cmd.transaction_id).await?;
                }
                "createStream" => {
                    conn.stream_id = PUBLISH_STREAM_ID;
                    conn.send_result(
                        cmd.transaction_id,
                        vec![Amf0Value::Number(f64::from(PUBLISH_STREAM_ID))],
                    )
                    .await?;
                }
                "releaseStream" | "FCPublish" | "_checkbw" => {
                    conn.send_result(cmd.transaction_id, vec![Amf0Value::Undefined])
                        .await?;
                }
                "publish" => {
                    let request = Self::stream_request(app.as_deref(), &cmd, true)?;
                    conn.stream_id = msg.stream_id.max(PUBLISH_STREAM_ID);
                    conn.send_status("status", "NetStream.Publish.Start", "Start publishing")
                        .await?;
                    tracing::debug!(app = %request.app(), stream = %request.stream(), "rtmp publish accepted");
                    return Ok((conn, request));
                }
                "play" => {
                    let request = Self::stream_request(app.as_deref(), &cmd, false)?;
                    conn.stream_id = msg.stream_id.max(PUBLISH_STREAM_ID);
                    conn.send(RtmpMessage::user_control(
                        user_control::STREAM_BEGIN,
                        &[conn.stream_id],
                    ))
                    .await?;
                    conn.send_status("status", "NetStream.Play.Reset", "Playing and resetting")
                        .await?;
                    conn.send_status("status", "NetStream.Play.Start", "Started playing")
                        .await?;
                    let access = RtmpMessage::data(
                        conn.stream_id,
                        &["|RtmpSampleAccess".into(), Amf0Value::Boolean(true), Amf0Value::Boolean(true)],
                    )?;
                    conn.send(access).await?;
                    tracing::debug!(app = %request.app(), stream = %request.stream(), "rtmp play accepted");
                    return Ok((conn, request));
                }
                other => tracing::trace!(command = other, "ignoring rtmp command"),
            }
        }
    }

    fn stream_request(
        app: Option<&str>,
        cmd: &Command,
        publish: bool,
    ) -> Result<ServerRequest, RtmpError> {
        let app = app.ok_or(RtmpErrorValue::NoAppName)?.to_string();
        let raw = cmd
            .first_string_arg()
            .filter(|name| !name.is_empty())
            .ok_or(RtmpErrorValue::NoStreamName)?;
        let (stream, query) = split_stream_name(raw);
        let stream = stream.to_string();
        let query = query.map(str::to_string);
        Ok(if publish {
            ServerRequest::Publish { app, stream, query }
        } else {
            ServerRequest::Play { app, stream, query }
        })
    }

    async fn reply_connect(&mut self, transaction_id: f64) -> Result<(), RtmpError> {
        self.send(RtmpMessage::window_ack_size(DEFAULT_WINDOW_ACK_SIZE)).await?;
        self.send(RtmpMessage::set_peer_bandwidth(DEFAULT_WINDOW_ACK_SIZE, 2)).await?;
        self.send(RtmpMessage::set_chunk_size(OUT_CHUNK_SIZE)).await?;
        let properties = Amf0Value::object([
            ("fmsVer", "FMS/3,0,1,123".into()),
            ("capabilities", 31.0.into()),
        ]);
        let information = Amf0Value::object([
            ("level", "status".into()),
            ("code", "NetConnection.Connect.Success".into()),
            ("description", "Connection succeeded.".into()),
            ("objectEncoding", 0.0.into()),
        ]);
        let msg = RtmpMessage::command(0, "_result", transaction_id, properties, vec![information])?;
        self.send(msg).await
    }

    /// Client side: handshake, connect, createStream and play. Returns once
    /// the server reports `NetStream.Play.Start`.
    pub async fn connect_play(mut io: S, address: &RtmpAddress) -> Result<Self, RtmpError> {
        client_handshake(&mut io).await?;
        let mut conn = Self::new(io);
        conn.send(RtmpMessage::set_chunk_size(OUT_CHUNK_SIZE)).await?;

        let connect = Amf0Value::object([
            ("app", address.app.as_str().into()),
            ("flashVer", "LNX 9,0,124,2".into()),
            ("tcUrl", address.tc_url.as_str().into()),
            ("fpad", Amf0Value::Boolean(false)),
            ("capabilities", 15.0.into()),
            ("audioCodecs", 4071.0.into()),
            ("videoCodecs", 252.0.into()),
            ("videoFunction", 1.0.into()),
        ]);
        conn.send(RtmpMessage::command(0, "connect", 1.0, connect, vec![])?)
            .await?;

        loop {
            let msg = conn.next_message().await?.ok_or(RtmpErrorValue::Closed)?;
            if conn.handle_control(&msg).await? {
                continue;
            }
            match msg.type_id {
                msg_type::AUDIO | msg_type::VIDEO | msg_type::AGGREGATE => {
                    conn.queue_media(&msg);
                    continue;
                }
                _ => {}
            }
            let Some(cmd) = msg.parse_command()? else {
                continue;
            };
            match (cmd.name.as_str(), cmd.transaction_id as u32) {
                ("_result", 1) => {
                    conn.send(RtmpMessage::command(0, "createStream", 2.0, Amf0Value::Null, vec![])?)
                        .await?;
                }
                ("_result", 2) => {
                    conn.stream_id = cmd
                        .args
                        .first()
                        .and_then(Amf0Value::as_number)
                        .map_or(PUBLISH_STREAM_ID, |id| id as u32);
                    let play = RtmpMessage::command(
                        conn.stream_id,
                        "play",
                        0.0,
                        Amf0Value::Null,
                        vec![address.stream.as_str().into(), (-2000.0).into()],
                    )?;
                    conn.send(play).await?;
                    conn.send(RtmpMessage::user_control(
                        user_control::SET_BUFFER_LENGTH,
                        &[conn.stream_id, 3000],
                    ))
                    .await?;
                }
                ("_error", _) => {
                    return Err(RtmpErrorValue::Rejected {
                        command: "connect".to_string(),
                        code: Self::status_code(&cmd),
                    }
                    .into());
                }
                ("onStatus", _) => {
                    let code = Self::status_code(&cmd);
                    let level = cmd
                        .args
                        .first()
                        .and_then(|info| info.get("level"))
                        .and_then(Amf0Value::as_str)
                        .unwrap_or_default();
                    if code == "NetStream.Play.Start" {
                        return Ok(conn);
                    }
                    if level == "error" || code.contains("StreamNotFound") || code.contains("Failed") {
                        return Err(RtmpErrorValue::Rejected {
                            command: "play".to_string(),
                            code,
                        }
                        .into());
                    }
                }
                _ => {}
            }
        }
    }

    fn status_code(cmd: &Command) -> String {
        cmd.args
            .first()
            .and_then(|info| info.get("code"))
            .and_then(Amf0Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }

    /// Next media message from a publisher or a pulled stream. `Ok(None)`
    /// when the peer unpublishes or closes the connection.
    pub async fn read_media(&mut self) -> Result<Option<MediaMessage>, RtmpError> {
        loop {
            if let Some(media) = self.pending.pop_front() {
                return Ok(Some(media));
            }
            let Some(msg) = self.next_message().await? else {
                return Ok(None);
            };
            if self.handle_control(&msg).await? {
                continue;
            }
            match msg.type_id {
                msg_type::AUDIO | msg_type::VIDEO | msg_type::AGGREGATE => self.queue_media(&msg),
                msg_type::DATA_AMF0 | msg_type::DATA_AMF3 => {
                    let mut values = msg.parse_data()?;
                    if values.first().and_then(Amf0Value::as_str) == Some("@setDataFrame") {
                        values.remove(0);
                    }
                    if values.first().and_then(Amf0Value::as_str) == Some("onMetaData") {
                        values.remove(0);
                        return Ok(Some(MediaMessage::Metadata(values)));
                    }
                }
                msg_type::COMMAND_AMF0 | msg_type::COMMAND_AMF3 => {
                    if let Some(cmd) = msg.parse_command()? {
                        match cmd.name.as_str() {
                            "deleteStream" | "closeStream" | "FCUnpublish" => return Ok(None),
                            "onStatus" if Self::status_code(&cmd).ends_with("UnpublishNotify") => {
                                return Ok(None);
                            }
                            "onStatus" if Self::status_code(&cmd) == "NetStream.Play.Stop" => {
                                return Ok(None);
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn queue_media(&mut self, msg: &RtmpMessage) {
        match msg.type_id {
            msg_type::AUDIO => self.pending.push_back(MediaMessage::Audio {
                timestamp: msg.timestamp,
                data: msg.payload.clone(),
            }),
            msg_type::VIDEO => self.pending.push_back(MediaMessage::Video {
                timestamp: msg.timestamp,
                data: msg.payload.clone(),
            }),
            msg_type::AGGREGATE => self.split_aggregate(msg),
            _ => {}
        }
    }

    /// Aggregate messages carry FLV tags back to back; sub-message timestamps
    /// are rebased onto the aggregate's own timestamp.
    fn split_aggregate(&mut self, msg: &RtmpMessage) {
        let data = &msg.payload;
        let mut offset = 0;
        let mut base: Option<u32> = None;
        while offset + 11 <= data.len() {
            let tag_type = data[offset];
            let size = BigEndian::read_u24(&data[offset + 1..offset + 4]) as usize;
            let ts = BigEndian::read_u24(&data[offset + 4..offset + 7])
                | (u32::from(data[offset + 7]) << 24);
            let body_start = offset + 11;
            if body_start + size > data.len() {
                break;
            }
            let first = *base.get_or_insert(ts);
            let timestamp = msg.timestamp.wrapping_add(ts.wrapping_sub(first));
            let body = data.slice(body_start..body_start + size);
            match tag_type {
                msg_type::AUDIO => self.pending.push_back(MediaMessage::Audio { timestamp, data: body }),
                msg_type::VIDEO => self.pending.push_back(MediaMessage::Video { timestamp, data: body }),
                _ => {}
            }
            offset = body_start + size + 4;
        }
    }

    pub async fn send_media(&mut self, media: MediaMessage) -> Result<(), RtmpError> {
        let msg = match media {
            MediaMessage::Audio { timestamp, data } => RtmpMessage::audio(self.stream_id, timestamp, data),
            MediaMessage::Video { timestamp, data } => RtmpMessage::video(self.stream_id, timestamp, data),
            MediaMessage::Metadata(values) => {
                let mut all = vec![Amf0Value::from("onMetaData")];
                all.extend(values);
                RtmpMessage::data(self.stream_id, &all)?
            }
        };
        self.send(msg).await
    }

    /// Tells a player the stream ended.
    pub async fn send_eof(&mut self) -> Result<(), RtmpError> {
        self.send(RtmpMessage::user_control(user_control::STREAM_EOF, &[self.stream_id]))
            .await?;
        self.send_status("status", "NetStream.Play.UnpublishNotify", "Stream unpublished")
            .await
    }

    async fn send_status(&mut self, level: &str, code: &str, description: &str) -> Result<(), RtmpError> {
        let msg = RtmpMessage::command(
            self.stream_id,
            "onStatus",
            0.0,
            Amf0Value::Null,
            vec![status_object(level, code, description)],
        )?;
        self.send(msg).await
    }

    async fn send_result(&mut self, transaction_id: f64, args: Vec<Amf0Value>) -> Result<(), RtmpError> {
        let msg = RtmpMessage::command(0, "_result", transaction_id, Amf0Value::Null, args)?;
        self.send(msg).await
    }

    async fn send(&mut self, msg: RtmpMessage) -> Result<(), RtmpError> {
        self.framed.send(msg).await
    }

    async fn next_message(&mut self) -> Result<Option<RtmpMessage>, RtmpError> {
        let msg = self.framed.next().await.transpose()?;
        let read = self.framed.codec().bytes_read();
        if self.peer_window > 0 && read - self.acked >= u64::from(self.peer_window) {
            self.acked = read;
            self.send(RtmpMessage::acknowledgement(read as u32)).await?;
        }
        Ok(msg)
    }

    /// Handles protocol control and user control messages. Returns true when
    /// the message was consumed.
    async fn handle_control(&mut self, msg: &RtmpMessage) -> Result<bool, RtmpError> {
        match msg.type_id {
            msg_type::SET_CHUNK_SIZE | msg_type::ABORT | msg_type::ACKNOWLEDGEMENT | msg_type::SET_PEER_BANDWIDTH => {
                Ok(true)
            }
            msg_type::WINDOW_ACK_SIZE => {
                self.peer_window = msg.control_value().unwrap_or_default();
                Ok(true)
            }
            msg_type::USER_CONTROL => {
                if msg.payload.len() >= 6
                    && BigEndian::read_u16(&msg.payload[..2]) == user_control::PING_REQUEST
                {
                    let stamp = BigEndian::read_u32(&msg.payload[2..6]);
                    self.send(RtmpMessage::user_control(user_control::PING_RESPONSE, &[stamp]))
                        .await?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
