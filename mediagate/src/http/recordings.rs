//! Recording control, playback queries and per-stream retention policy.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use mediagate_core::{
    config::RetentionPolicy,
    recording::{EventCapture, EventRequest, SegmentRecord, StreamRecordings},
};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use super::{parse_body, stream_key, AppError, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RangeQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

pub async fn overview(State(state): State<AppState>) -> Json<Vec<StreamRecordings>> {
    Json(state.session.recording().summaries())
}

/// `GET /api/recordings/{app}/{stream}?start=&end=` (RFC 3339 bounds)
pub async fn list(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
    Query(range): Query<RangeQuery>,
) -> AppResult<Json<Vec<SegmentRecord>>> {
    let key = stream_key(&app, &stream)?;
    Ok(Json(state.session.recording().list_segments(&key, range.start, range.end)))
}

pub async fn on_date(
    State(state): State<AppState>,
    Path((app, stream, date)): Path<(String, String, String)>,
) -> AppResult<Json<Vec<SegmentRecord>>> {
    let key = stream_key(&app, &stream)?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| AppError::bad_request(format!("date must be YYYY-MM-DD, got {date}")))?;
    Ok(Json(state.session.recording().segments_on(&key, date)))
}

pub async fn start(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let key = stream_key(&app, &stream)?;
    state.session.recording().start_continuous(&key).await?;
    info!(stream = %key, "Continuous recording started through API");
    Ok(StatusCode::NO_CONTENT)
}

/// The closed segment, or 204 when recording stopped before the first
/// keyframe opened one.
pub async fn stop(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
) -> AppResult<Response> {
    let key = stream_key(&app, &stream)?;
    Ok(match state.session.recording().stop_continuous(&key).await? {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Body `{preRollSeconds?, postRollSeconds?}`; an empty body uses the
/// stream's policy.
pub async fn trigger_event(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<Json<EventCapture>> {
    let key = stream_key(&app, &stream)?;
    let request: EventRequest = if body.is_empty() { EventRequest::default() } else { parse_body(&body)? };
    let capture = state.session.recording().trigger_event(&key, request).await?;
    info!(
        stream = %key,
        segment = %capture.segment_id,
        extended = capture.extended,
        "Event capture triggered"
    );
    Ok(Json(capture))
}

pub async fn delete_all(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    let key = stream_key(&app, &stream)?;
    let deleted = state.session.recording().delete_all(&key).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

/// Streams a closed segment. The read lease is held by the body, so
/// retention skips the file until the client is done.
pub async fn download(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Response> {
    let download = state.session.recording().open_segment(&id).await?;
    let name = download
        .record
        .path
        .file_name()
        .map_or_else(|| format!("{id}.ts"), |n| n.to_string_lossy().into_owned());
    // the file on disk, not the index, decides what gets sent
    let length = download
        .file
        .metadata()
        .await
        .map_err(|e| AppError::internal(format!("stat segment {id}: {e}")))?
        .len();
    let lease = download.lease;
    let body = ReaderStream::new(download.file).map(move |chunk| {
        let _held = &lease;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CONTENT_LENGTH, length)
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\""))
        .body(Body::from_stream(body))
        .map(IntoResponse::into_response)
        .map_err(|_| AppError::internal("Failed to build response"))
}

pub async fn get_policy(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
) -> AppResult<Json<RetentionPolicy>> {
    let key = stream_key(&app, &stream)?;
    Ok(Json(state.session.policies().get(&key)))
}

pub async fn set_policy(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<Json<RetentionPolicy>> {
    let key = stream_key(&app, &stream)?;
    let policy: RetentionPolicy = parse_body(&body)?;
    state.session.policies().set(&key, policy)?;
    info!(stream = %key, ?policy, "Retention policy updated");
    Ok(Json(policy))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::{body::to_bytes, http::StatusCode};
    use bytes::Bytes;
    use mediagate_core::{CodecTag, Frame, StreamKey, TrackInfo};
    use serde_json::json;

    use crate::http::tests::{app, json, send};

    const CONFIG: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF, 0xE5, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00, 0x00,
        0x03, 0x00, 0xF2, 0x3C, 0x58, 0xBA, 0x80, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80,
    ];

    fn keyframe(ts: i64) -> Frame {
        Frame::video(CodecTag::H264, ts, ts, true, Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00]))
    }

    #[tokio::test]
    async fn test_record_list_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;
        let key = StreamKey::new("live", "cam1").unwrap();
        let stream = session.registry().register(&key).unwrap();
        stream
            .bus()
            .set_tracks(vec![TrackInfo::video(CodecTag::H264, Some(Bytes::from_static(CONFIG)))]);
        session.recording().attach(&stream).unwrap();

        let response = send(&router, "POST", "/api/recordings/live/cam1/start", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&router, "POST", "/api/recordings/live/cam1/start", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        for ts in (0..5000).step_by(1000) {
            stream.bus().publish(keyframe(ts));
        }
        let response = send(&router, "POST", "/api/recordings/live/cam1/stop", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let segment = json(response).await;
        assert_eq!(segment["status"], "complete");

        let listed = json(send(&router, "GET", "/api/recordings/live/cam1", None).await).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        let overview = json(send(&router, "GET", "/api/recordings", None).await).await;
        assert_eq!(overview[0]["segments"], 1);

        let date = segment["startTime"].as_str().unwrap()[..10].to_string();
        let on_date = json(send(&router, "GET", &format!("/api/recordings/live/cam1/dates/{date}"), None).await).await;
        assert_eq!(on_date.as_array().unwrap().len(), 1);
        let response = send(&router, "GET", "/api/recordings/live/cam1/dates/yesterday", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let id = segment["id"].as_str().unwrap();
        let response = send(&router, "GET", &format!("/api/recordings/segments/{id}/download"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len() as u64, segment["sizeBytes"].as_u64().unwrap());
        assert_eq!(bytes[0], 0x47);

        let response = send(&router, "GET", "/api/recordings/segments/nope/download", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_sends_the_file_as_it_is_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;
        let key = StreamKey::new("live", "cam1").unwrap();
        let stream = session.registry().register(&key).unwrap();
        stream
            .bus()
            .set_tracks(vec![TrackInfo::video(CodecTag::H264, Some(Bytes::from_static(CONFIG)))]);
        session.recording().attach(&stream).unwrap();
        session.recording().start_continuous(&key).await.unwrap();
        for ts in (0..3000).step_by(1000) {
            stream.bus().publish(keyframe(ts));
        }
        let record = session.recording().stop_continuous(&key).await.unwrap().unwrap();

        // the file grew behind the index's back
        let mut file = std::fs::OpenOptions::new().append(true).open(&record.path).unwrap();
        file.write_all(&[0x47; 188]).unwrap();
        drop(file);

        let uri = format!("/api/recordings/segments/{}/download", record.id);
        let response = send(&router, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let expected = record.size_bytes + 188;
        assert_eq!(response.headers()["content-length"], expected.to_string().as_str());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len() as u64, expected);
    }

    #[tokio::test]
    async fn test_stop_before_any_segment_is_no_content() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;
        let key = StreamKey::new("live", "cam1").unwrap();
        let stream = session.registry().register(&key).unwrap();
        session.recording().attach(&stream).unwrap();

        let response = send(&router, "POST", "/api/recordings/live/cam1/start", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&router, "POST", "/api/recordings/live/cam1/stop", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&router, "POST", "/api/recordings/live/cam1/stop", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_on_unknown_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _session) = app(dir.path()).await;
        let body = json!({ "postRollSeconds": 30 });
        let response = send(&router, "POST", "/api/recordings/live/ghost/event", Some(body)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_policy_roundtrip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _session) = app(dir.path()).await;

        let default = json(send(&router, "GET", "/api/policies/live/cam1", None).await).await;
        assert_eq!(default["segmentDurationSeconds"], 60);

        let policy = json!({
            "maxAgeDays": 7,
            "maxTotalBytes": 1_000_000,
            "preRollSeconds": 3,
            "postRollSeconds": 20,
            "segmentDurationSeconds": 300,
        });
        let response = send(&router, "PUT", "/api/policies/live/cam1", Some(policy)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let stored = json(send(&router, "GET", "/api/policies/live/cam1", None).await).await;
        assert_eq!(stored["segmentDurationSeconds"], 300);
        assert_eq!(stored["maxAgeDays"], 7);

        let response = send(
            &router,
            "PUT",
            "/api/policies/live/cam1",
            Some(json!({ "segmentDurationSeconds": 0 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
