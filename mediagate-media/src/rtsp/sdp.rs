use {
    super::errors::{RtspError, RtspErrorValue},
    base64::{engine::general_purpose::STANDARD, Engine},
    bytes::Bytes,
    std::{collections::HashMap, fmt::Write},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    /// `video` or `audio`.
    pub media: String,
    pub payload_type: u8,
    /// Upper-cased encoding name from `a=rtpmap`, e.g. `H264`, `MPEG4-GENERIC`, `PCMA`.
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: HashMap<String, String>,
    pub control: Option<String>,
}

impl MediaDescription {
    /// SPS and PPS from `sprop-parameter-sets`.
    #[must_use]
    pub fn h264_parameter_sets(&self) -> (Option<Bytes>, Option<Bytes>) {
        let Some(sprop) = self.fmtp.get("sprop-parameter-sets") else {
            return (None, None);
        };
        let mut sps = None;
        let mut pps = None;
        for encoded in sprop.split(',') {
            let Ok(nalu) = STANDARD.decode(encoded.trim()) else {
                continue;
            };
            match nalu.first().map(|b| b & 0x1F) {
                Some(7) => sps = Some(Bytes::from(nalu)),
                Some(8) => pps = Some(Bytes::from(nalu)),
                _ => {}
            }
        }
        (sps, pps)
    }

    /// AudioSpecificConfig from the hex `config` parameter (RFC 3640).
    #[must_use]
    pub fn aac_config(&self) -> Option<Bytes> {
        let hex = self.fmtp.get("config")?;
        if hex.len() % 2 != 0 {
            return None;
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from)
    }

    /// Track URL: absolute control attributes are used as-is, relative ones
    /// are joined to the content base.
    #[must_use]
    pub fn control_url(&self, base: &str) -> String {
        match self.control.as_deref() {
            None | Some("*") => base.to_string(),
            Some(control) if control.starts_with("rtsp://") => control.to_string(),
            Some(control) => format!("{}/{}", base.trim_end_matches('/'), control),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_name: String,
    pub control: Option<String>,
    pub medias: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self, RtspError> {
        let mut sdp = Self::default();
        for line in text.lines().map(str::trim).filter(|l| l.len() > 2) {
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| RtspErrorValue::BadSdp(line.to_string()))?;
            match kind {
                "s" => sdp.session_name = value.to_string(),
                "m" => {
                    let mut fields = value.split_whitespace();
                    let media = fields.next().unwrap_or_default().to_string();
                    let payload_type = fields
                        .nth(2)
                        .and_then(|pt| pt.parse().ok())
                        .ok_or_else(|| RtspErrorValue::BadSdp(line.to_string()))?;
                    sdp.medias.push(MediaDescription {
                        media,
                        payload_type,
                        ..MediaDescription::default()
                    });
                }
                "a" => {
                    let (attr, attr_value) = value.split_once(':').unwrap_or((value, ""));
                    match sdp.medias.last_mut() {
                        None if attr == "control" => sdp.control = Some(attr_value.to_string()),
                        None => {}
                        Some(media) => Self::apply_attribute(media, attr, attr_value),
                    }
                }
                _ => {}
            }
        }
        for media in &mut sdp.medias {
            if media.encoding.is_empty() {
                // static payload types
                let (encoding, rate) = match media.payload_type {
                    0 => ("PCMU", 8000),
                    8 => ("PCMA", 8000),
                    _ => continue,
                };
                media.encoding = encoding.to_string();
                media.clock_rate = rate;
            }
        }
        Ok(sdp)
    }

    fn apply_attribute(media: &mut MediaDescription, attr: &str, value: &str) {
        match attr {
            "control" => media.control = Some(value.to_string()),
            "rtpmap" => {
                let Some((_, codec)) = value.split_once(' ') else {
                    return;
                };
                let mut parts = codec.split('/');
                media.encoding = parts.next().unwrap_or_default().to_ascii_uppercase();
                media.clock_rate = parts.next().and_then(|r| r.parse().ok()).unwrap_or(90_000);
                media.channels = parts.next().and_then(|c| c.parse().ok());
            }
            "fmtp" => {
                let Some((_, params)) = value.split_once(' ') else {
                    return;
                };
                for param in params.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                    let (key, val) = param.split_once('=').unwrap_or((param, ""));
                    media.fmtp.insert(key.to_ascii_lowercase(), val.to_string());
                }
            }
            _ => {}
        }
    }

    pub fn video(&self) -> Option<&MediaDescription> {
        self.medias.iter().find(|m| m.media == "video")
    }

    pub fn audio(&self) -> Option<&MediaDescription> {
        self.medias.iter().find(|m| m.media == "audio")
    }
}

/// Builds the SDP served in DESCRIBE responses.
#[derive(Debug, Default)]
pub struct SdpBuilder {
    body: String,
    tracks: usize,
}

impl SdpBuilder {
    #[must_use]
    pub fn new(session_name: &str, origin_ip: &str) -> Self {
        let mut body = String::with_capacity(512);
        let _ = write!(
            body,
            "v=0\r\no=- 0 0 IN IP4 {origin_ip}\r\ns={session_name}\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\na=control:*\r\n"
        );
        Self { body, tracks: 0 }
    }

    #[must_use]
    pub fn h264(mut self, payload_type: u8, sps: Option<&[u8]>, pps: Option<&[u8]>) -> Self {
        let _ = write!(
            self.body,
            "m=video 0 RTP/AVP {payload_type}\r\na=rtpmap:{payload_type} H264/90000\r\n"
        );
        let mut fmtp = format!("a=fmtp:{payload_type} packetization-mode=1");
        if let (Some(sps), Some(pps)) = (sps, pps) {
            if sps.len() >= 4 {
                let _ = write!(fmtp, ";profile-level-id={:02X}{:02X}{:02X}", sps[1], sps[2], sps[3]);
            }
            let _ = write!(
                fmtp,
                ";sprop-parameter-sets={},{}",
                STANDARD.encode(sps),
                STANDARD.encode(pps)
            );
        }
        let _ = write!(self.body, "{fmtp}\r\na=control:track{}\r\n", self.tracks);
        self.tracks += 1;
        self
    }

    #[must_use]
    pub fn aac(mut self, payload_type: u8, sample_rate: u32, channels: u8, config: &[u8]) -> Self {
        let hex: String = config.iter().map(|b| format!("{b:02x}")).collect();
        let _ = write!(
            self.body,
            "m=audio 0 RTP/AVP {payload_type}\r\na=rtpmap:{payload_type} MPEG4-GENERIC/{sample_rate}/{channels}\r\n\
             a=fmtp:{payload_type} streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={hex}\r\n\
             a=control:track{}\r\n",
            self.tracks
        );
        self.tracks += 1;
        self
    }

    #[must_use]
    pub fn g711(mut self, alaw: bool) -> Self {
        let (pt, name) = if alaw { (8, "PCMA") } else { (0, "PCMU") };
        let _ = write!(
            self.body,
            "m=audio 0 RTP/AVP {pt}\r\na=rtpmap:{pt} {name}/8000\r\na=control:track{}\r\n",
            self.tracks
        );
        self.tracks += 1;
        self
    }

    #[must_use]
    pub fn build(self) -> String {
        self.body
    }
}
