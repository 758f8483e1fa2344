//! GB28181 media handoff. SIP negotiation happens elsewhere; what arrives
//! here is the agreed stream key, transport, port and SSRC, and the core
//! binds a receiver for the MPEG-PS over RTP the device will send.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::{
    rtp::{PayloadFormat, PayloadMapping, RtpDemux, RtpReceiver, RtpSource},
    RtpTransport,
};
use crate::{
    error::{GatewayError, Result},
    frame::{CodecTag, StreamKey, TrackKind},
};

/// PS payload type used by GB28181 devices.
pub const PS_PAYLOAD_TYPE: u8 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GbTransport {
    #[default]
    Udp,
    /// The device connects to us.
    TcpPassive,
}

impl From<GbTransport> for RtpTransport {
    fn from(transport: GbTransport) -> Self {
        match transport {
            GbTransport::Udp => Self::Udp,
            GbTransport::TcpPassive => Self::Tcp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gb28181Binding {
    /// `app/stream`
    pub stream_key: String,
    #[serde(default)]
    pub transport: GbTransport,
    /// 0 allocates from `ingest.rtp_port_range`.
    #[serde(default)]
    pub port: u16,
    /// Drop packets from any other SSRC.
    #[serde(default)]
    pub ssrc: Option<u32>,
    /// Video codec negotiated in SDP; other codecs are counted as corrupt.
    #[serde(default)]
    pub codec: Option<CodecTag>,
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,
    #[serde(default = "default_true")]
    pub enable_audio: bool,
}

const fn default_payload_type() -> u8 {
    PS_PAYLOAD_TYPE
}

const fn default_true() -> bool {
    true
}

impl Gb28181Binding {
    pub fn key(&self) -> Result<StreamKey> {
        self.stream_key.parse()
    }

    /// Binds the receiver. The returned source reports the bound port.
    pub async fn bind(&self, ip: IpAddr, port_range: [u16; 2]) -> Result<RtpSource> {
        if let Some(codec) = self.codec {
            if codec.kind() != TrackKind::Video {
                return Err(GatewayError::InvalidInput(format!("{codec:?} is not a video codec")));
            }
        }
        let mut demux = RtpDemux::from_mappings(
            &[PayloadMapping::new(self.payload_type, PayloadFormat::Ps)],
            self.enable_audio,
        )?
        .with_ssrc(self.ssrc);
        if let Some(codec) = self.codec {
            demux.expect_video_codec(self.payload_type, codec);
        }
        let receiver = RtpReceiver::bind(self.transport.into(), ip, self.port, port_range).await?;
        Ok(RtpSource::new(receiver, demux))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::FrameSource;
    use mediagate_media::{
        mpegts::define::stream_type,
        ps::mux_video_unit,
        rtp::{RtpHeader, RtpPacket},
    };
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;

    fn ps_packet(seq: u16, ssrc: u32, es: &[u8], pts: u64) -> Vec<u8> {
        RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: PS_PAYLOAD_TYPE,
                sequence_number: seq,
                timestamp: pts as u32,
                ssrc,
                csrcs: Vec::new(),
            },
            payload: mux_video_unit(es, pts, stream_type::H264),
        }
        .marshal()
        .to_vec()
    }

    #[tokio::test]
    async fn test_udp_binding_demuxes_ps() {
        let binding: Gb28181Binding = serde_json::from_value(serde_json::json!({
            "stream_key": "gb/34020000001320000001",
            "ssrc": 1001,
            "codec": "h264",
        }))
        .unwrap();
        assert_eq!(binding.key().unwrap().app, "gb");

        let mut source = binding
            .bind(IpAddr::V4(Ipv4Addr::LOCALHOST), [0, 0])
            .await
            .unwrap();
        let port = source.local_port().unwrap();

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let idr = [0, 0, 0, 1, 0x67, 0x42, 0, 0x1F, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88];
        // foreign ssrc first, must be ignored
        sender
            .send_to(&ps_packet(1, 999, &idr, 3600), (Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        sender
            .send_to(&ps_packet(2, 1001, &idr, 90_000), (Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        sender
            .send_to(&ps_packet(3, 1001, &[0, 0, 0, 1, 0x41, 0x9A], 93_600), (Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();

        let first = source.next_frame().await.unwrap().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.dts_ms, 0);
        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.dts_ms, 40);
        let tracks = source.take_track_update().unwrap();
        assert_eq!(tracks[0].codec, CodecTag::H264);
    }

    #[tokio::test]
    async fn test_audio_codec_rejected() {
        let binding = Gb28181Binding {
            stream_key: "gb/1".to_string(),
            transport: GbTransport::Udp,
            port: 0,
            ssrc: None,
            codec: Some(CodecTag::Aac),
            payload_type: PS_PAYLOAD_TYPE,
            enable_audio: true,
        };
        assert!(binding.bind(IpAddr::V4(Ipv4Addr::LOCALHOST), [0, 0]).await.is_err());
    }
}
