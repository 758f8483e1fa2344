//! Live media over HTTP.
//!
//! - `GET /{app}/{stream}.live.flv|.live.ts|.live.mp4`: continuous body
//! - `GET /{app}/{stream}/hls.m3u8` and `hls.fmp4.m3u8`: playlists, with
//!   their segments (`N.ts`, `N.m4s`, `init.mp4`) beside them
//! - `POST /webrtc/{app}/{stream}`: SDP offer in, answer out
//!
//! Every request goes through the session manager, so a pull proxy marked
//! on demand starts on the first viewer.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use mediagate_core::{
    output::{hls::HlsVariant, webrtc::WebRtcAnswer, OutputSession},
    GatewayError, Protocol,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, info};

use super::{stream_key, AppError, AppResult, AppState};

const HTTP_SUFFIXES: [(&str, Protocol); 3] = [
    (".live.flv", Protocol::Flv),
    (".live.ts", Protocol::HttpTs),
    (".live.mp4", Protocol::HttpFmp4),
];

fn unexpected(session: &OutputSession) -> AppError {
    AppError::internal(format!("unexpected output session {session:?}"))
}

pub async fn http_stream(
    State(state): State<AppState>,
    Path((app, file)): Path<(String, String)>,
) -> AppResult<Response> {
    let (stream, protocol) = HTTP_SUFFIXES
        .iter()
        .find_map(|(suffix, protocol)| file.strip_suffix(suffix).map(|stream| (stream, *protocol)))
        .ok_or_else(|| AppError::not_found(format!("/{app}/{file}")))?;
    let key = stream_key(&app, stream)?;

    let session = state.session.attach_default(&key, protocol).await?;
    let OutputSession::Body(output) = session else {
        return Err(unexpected(&session));
    };
    info!(stream = %key, %protocol, "HTTP stream started");

    let body = Body::from_stream(ReceiverStream::new(output.body).map(Ok::<Bytes, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, output.content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .map(IntoResponse::into_response)
        .map_err(|_| AppError::internal("Failed to build response"))
}

pub async fn hls(
    State(state): State<AppState>,
    Path((app, stream, file)): Path<(String, String, String)>,
) -> AppResult<Response> {
    let key = stream_key(&app, &stream)?;

    let playlist = [HlsVariant::Ts, HlsVariant::Fmp4]
        .into_iter()
        .find(|variant| variant.playlist_name() == file);
    if let Some(variant) = playlist {
        let session = state.session.attach_default(&key, variant.protocol()).await?;
        let OutputSession::Hls(hls) = session else {
            return Err(unexpected(&session));
        };
        let wait = state.session.outputs().hls().first_segment_wait();
        let body = hls.playlist(wait).await?;
        debug!(stream = %key, ?variant, "Serving HLS playlist");
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
            .header(header::CACHE_CONTROL, "no-cache, no-store")
            .body(Body::from(body))
            .map(IntoResponse::into_response)
            .map_err(|_| AppError::internal("Failed to build response"));
    }

    let variant = if file.ends_with(".ts") {
        HlsVariant::Ts
    } else if file.ends_with(".m4s") || file == "init.mp4" {
        HlsVariant::Fmp4
    } else {
        return Err(AppError::not_found(format!("/{app}/{stream}/{file}")));
    };
    // segments never start a segmenter; only playlist requests do
    let hls = state
        .session
        .outputs()
        .hls()
        .get(&key, variant)
        .ok_or_else(|| GatewayError::NotFound(format!("no {variant:?} segmenter for {key}")))?;
    let data = hls.segment(&file).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, variant.segment_content_type())
        .header(header::CACHE_CONTROL, "public, max-age=90")
        .body(Body::from(data))
        .map(IntoResponse::into_response)
        .map_err(|_| AppError::internal("Failed to build response"))
}

/// The request body is the SDP offer.
pub async fn webrtc(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
    offer: String,
) -> AppResult<(StatusCode, Json<WebRtcAnswer>)> {
    let key = stream_key(&app, &stream)?;
    if offer.trim().is_empty() {
        return Err(AppError::bad_request("SDP offer required"));
    }
    let options = state.session.outputs().default_options().with_offer(offer);
    let session = state.session.attach(&key, Protocol::WebRtc, options).await?;
    let OutputSession::WebRtc(answer) = session else {
        return Err(unexpected(&session));
    };
    info!(stream = %key, session = %answer.session_id, "WebRTC viewer negotiated");
    Ok((StatusCode::CREATED, Json(answer)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Body, http::Request, http::StatusCode};
    use bytes::Bytes;
    use mediagate_core::{CodecTag, Frame, Protocol, StreamKey, TrackInfo};
    use tokio_stream::StreamExt;
    use tower::ServiceExt;

    use crate::http::tests::{app, json, send};

    const CONFIG: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF, 0xE5, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00, 0x00,
        0x03, 0x00, 0xF2, 0x3C, 0x58, 0xBA, 0x80, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80,
    ];

    fn video(ts: i64) -> Frame {
        let keyframe = ts % 1000 == 0;
        let nal: &'static [u8] = if keyframe {
            &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00]
        } else {
            &[0, 0, 0, 1, 0x41, 0x9A, 0x02]
        };
        Frame::video(CodecTag::H264, ts, ts, keyframe, Bytes::from_static(nal))
    }

    #[tokio::test]
    async fn test_unknown_stream_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _session) = app(dir.path()).await;

        let response = send(&router, "GET", "/live/ghost.live.flv", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["code"], "not_found");

        let response = send(&router, "GET", "/live/ghost.avi", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&router, "GET", "/live/ghost/0.ts", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_flv_body_starts_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;
        let stream = session.registry().register(&StreamKey::new("live", "cam1").unwrap()).unwrap();
        stream
            .bus()
            .set_tracks(vec![TrackInfo::video(CodecTag::H264, Some(Bytes::from_static(CONFIG)))]);

        let request = Request::builder().uri("/live/cam1.live.flv").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "video/x-flv");

        for ts in (0..200).step_by(40) {
            stream.bus().publish(video(ts));
        }
        let mut body = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(first.starts_with(b"FLV"));
    }

    #[tokio::test]
    async fn test_hls_playlist_then_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;
        let key = StreamKey::new("live", "cam1").unwrap();
        let stream = session.registry().register(&key).unwrap();
        stream
            .bus()
            .set_tracks(vec![TrackInfo::video(CodecTag::H264, Some(Bytes::from_static(CONFIG)))]);

        // segments are refused until a playlist request started the segmenter
        let response = send(&router, "GET", "/live/cam1/0.ts", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // the segmenter a playlist request would start
        session.attach_default(&key, Protocol::Hls).await.unwrap();
        for ts in (0..10_000).step_by(40) {
            stream.bus().publish(video(ts));
        }

        let response = send(&router, "GET", "/live/cam1/hls.m3u8", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(text.starts_with("#EXTM3U"));
        let segment = text.lines().find(|line| line.ends_with(".ts")).unwrap().to_string();

        let response = send(&router, "GET", &format!("/live/cam1/{segment}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "video/mp2t");
    }
}
