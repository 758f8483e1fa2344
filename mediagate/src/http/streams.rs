use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use mediagate_core::session::StreamOverview;
use serde::Deserialize;
use tracing::info;

use super::{stream_key, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReleaseQuery {
    force: bool,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<StreamOverview>> {
    Json(state.session.streams())
}

pub async fn get(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
) -> AppResult<Json<StreamOverview>> {
    let key = stream_key(&app, &stream)?;
    Ok(Json(state.session.stream(&key)?))
}

/// `DELETE /api/streams/{app}/{stream}?force=bool`
pub async fn release(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
    Query(query): Query<ReleaseQuery>,
) -> AppResult<StatusCode> {
    let key = stream_key(&app, &stream)?;
    state.session.release_stream(&key, query.force).await?;
    info!(stream = %key, force = query.force, "Stream released through API");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use mediagate_core::{Protocol, StreamKey};

    use crate::http::tests::{app, json, send};

    #[tokio::test]
    async fn test_stream_lifecycle_through_api() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;

        let response = send(&router, "GET", "/api/streams/live/cam1", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["code"], "not_found");

        let key = StreamKey::new("live", "cam1").unwrap();
        let stream = session.registry().register(&key).unwrap();
        let _viewer = mediagate_core::output::FrameConsumer::attach(
            &stream,
            Protocol::Rtmp,
            &session.outputs().default_options(),
        )
        .unwrap();

        let listed = json(send(&router, "GET", "/api/streams", None).await).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["stream"], "cam1");
        assert_eq!(listed[0]["consumers"]["rtmp"], 1);

        // a viewer keeps it busy until forced
        let response = send(&router, "DELETE", "/api/streams/live/cam1", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = send(&router, "DELETE", "/api/streams/live/cam1?force=true", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(stream.is_closed());
    }
}
