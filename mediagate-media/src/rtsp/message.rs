use {
    super::{
        errors::{RtspError, RtspErrorValue},
        RTSP_VERSION,
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    std::fmt::Write,
    tokio_util::codec::{Decoder, Encoder},
};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replaces an existing header of the same name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn cseq(&self) -> Option<u32> {
        self.get("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session id without the `;timeout=` parameter.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.get("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RtspRequest {
    #[must_use]
    pub fn new(method: &str, uri: &str, cseq: u32) -> Self {
        let mut headers = Headers::default();
        headers.set("CSeq", cseq.to_string());
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            headers,
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RtspResponse {
    #[must_use]
    pub fn new(status: u16, cseq: Option<u32>) -> Self {
        let mut headers = Headers::default();
        if let Some(cseq) = cseq {
            headers.set("CSeq", cseq.to_string());
        }
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers,
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn ok(cseq: Option<u32>) -> Self {
        Self::new(200, cseq)
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }
}

#[must_use]
pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Anything that can appear on an RTSP TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspItem {
    Request(RtspRequest),
    Response(RtspResponse),
    Interleaved { channel: u8, data: Bytes },
}

#[derive(Debug, Default)]
pub struct RtspCodec;

fn find_head_end(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, RtspError> {
    let mut headers = Headers::default();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RtspErrorValue::BadHeader(line.to_string()))?;
        headers.0.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

impl Decoder for RtspCodec {
    type Item = RtspItem;
    type Error = RtspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.first() == Some(&b'$') {
            if src.len() < 4 {
                return Ok(None);
            }
            let channel = src[1];
            let len = u16::from_be_bytes([src[2], src[3]]) as usize;
            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }
            src.advance(4);
            let data = src.split_to(len).freeze();
            return Ok(Some(RtspItem::Interleaved { channel, data }));
        }

        let Some(head_len) = find_head_end(src) else {
            if src.len() > MAX_HEAD_SIZE {
                return Err(RtspErrorValue::HeadTooLarge(MAX_HEAD_SIZE).into());
            }
            return Ok(None);
        };
        let head = std::str::from_utf8(&src[..head_len]).map_err(|_| RtspErrorValue::Utf8)?;
        let mut lines = head.split("\r\n");
        let start = lines.next().unwrap_or_default().to_string();
        let headers = parse_headers(lines)?;

        let body_len = match headers.get("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|len| *len <= MAX_BODY_SIZE)
                .ok_or_else(|| RtspErrorValue::BadContentLength(value.to_string()))?,
            None => 0,
        };
        if src.len() < head_len + body_len {
            return Ok(None);
        }
        src.advance(head_len);
        let body = src.split_to(body_len).freeze();

        let mut parts = start.splitn(3, ' ');
        let (first, second, third) = (
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
        );
        if first.starts_with("RTSP/") {
            let status = second
                .parse()
                .map_err(|_| RtspErrorValue::BadStartLine(start.clone()))?;
            Ok(Some(RtspItem::Response(RtspResponse {
                status,
                reason: third.to_string(),
                headers,
                body,
            })))
        } else if third.starts_with("RTSP/") && !second.is_empty() {
            Ok(Some(RtspItem::Request(RtspRequest {
                method: first.to_string(),
                uri: second.to_string(),
                headers,
                body,
            })))
        } else {
            Err(RtspErrorValue::BadStartLine(start).into())
        }
    }
}

fn write_head(dst: &mut BytesMut, start: &str, headers: &Headers, body: &Bytes) {
    let mut head = String::with_capacity(256);
    head.push_str(start);
    head.push_str("\r\n");
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }
    if !body.is_empty() {
        let _ = write!(head, "Content-Length: {}\r\n", body.len());
    }
    head.push_str("\r\n");
    dst.put_slice(head.as_bytes());
    dst.put_slice(body);
}

impl Encoder<RtspItem> for RtspCodec {
    type Error = RtspError;

    fn encode(&mut self, item: RtspItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RtspItem::Request(req) => {
                let start = format!("{} {} {RTSP_VERSION}", req.method, req.uri);
                write_head(dst, &start, &req.headers, &req.body);
            }
            RtspItem::Response(resp) => {
                let start = format!("{RTSP_VERSION} {} {}", resp.status, resp.reason);
                write_head(dst, &start, &resp.headers, &resp.body);
            }
            RtspItem::Interleaved { channel, data } => {
                let len = u16::try_from(data.len())
                    .map_err(|_| RtspErrorValue::BadContentLength(data.len().to_string()))?;
                dst.reserve(4 + data.len());
                dst.put_u8(b'$');
                dst.put_u8(channel);
                dst.put_u16(len);
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}

/// Parsed `Transport` header, the subset the gateway negotiates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transport {
    pub tcp: bool,
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub multicast: bool,
}

fn pair<T: std::str::FromStr + Copy>(value: &str) -> Option<(T, T)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
        None => {
            let single = value.parse().ok()?;
            Some((single, single))
        }
    }
}

impl Transport {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut transport = Self::default();
        for part in value.split(';').map(str::trim) {
            let (key, val) = part.split_once('=').unwrap_or((part, ""));
            match key {
                k if k.starts_with("RTP/AVP") => transport.tcp = k.ends_with("/TCP"),
                "multicast" => transport.multicast = true,
                "interleaved" => transport.interleaved = pair(val),
                "client_port" => transport.client_port = pair(val),
                "server_port" => transport.server_port = pair(val),
                _ => {}
            }
        }
        transport
    }

    #[must_use]
    pub fn interleaved(rtp: u8) -> Self {
        Self {
            tcp: true,
            interleaved: Some((rtp, rtp.wrapping_add(1))),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_header(&self) -> String {
        let mut out = String::from(if self.tcp { "RTP/AVP/TCP" } else { "RTP/AVP" });
        out.push_str(if self.multicast { ";multicast" } else { ";unicast" });
        if let Some((a, b)) = self.interleaved {
            let _ = write!(out, ";interleaved={a}-{b}");
        }
        if let Some((a, b)) = self.client_port {
            let _ = write!(out, ";client_port={a}-{b}");
        }
        if let Some((a, b)) = self.server_port {
            let _ = write!(out, ";server_port={a}-{b}");
        }
        out
    }
}
