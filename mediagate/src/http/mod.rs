//! HTTP surface: the JSON management API under `/api` and the media
//! endpoints (HTTP-FLV/TS/fMP4, HLS, WebRTC) beside it.

mod error;
mod ingest;
mod live;
mod proxies;
mod recordings;
mod streams;

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use mediagate_core::{config::Config, session::SessionManager, StreamKey};
use serde::de::DeserializeOwned;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{AppError, AppResult};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionManager>,
    pub config: Arc<Config>,
}

pub fn create_router(session: Arc<SessionManager>, config: Arc<Config>) -> Router {
    let state = AppState { session, config };

    let api = Router::new()
        .route("/streams", get(streams::list))
        .route("/streams/{app}/{stream}", get(streams::get).delete(streams::release))
        .route("/proxies", get(proxies::list).post(proxies::create))
        .route("/proxies/{app}/{stream}", delete(proxies::remove))
        .route("/ingest/gb28181", post(ingest::bind_gb28181))
        .route("/ingest/rtp", post(ingest::bind_rtp))
        .route("/recordings", get(recordings::overview))
        .route(
            "/recordings/{app}/{stream}",
            get(recordings::list).delete(recordings::delete_all),
        )
        .route("/recordings/{app}/{stream}/dates/{date}", get(recordings::on_date))
        .route("/recordings/{app}/{stream}/start", post(recordings::start))
        .route("/recordings/{app}/{stream}/stop", post(recordings::stop))
        .route("/recordings/{app}/{stream}/event", post(recordings::trigger_event))
        .route("/recordings/segments/{id}/download", get(recordings::download))
        .route(
            "/policies/{app}/{stream}",
            get(recordings::get_policy).put(recordings::set_policy),
        )
        .route("/server/config", get(server_config));

    Router::new()
        .route("/healthz", get(health_check))
        .nest("/api", api)
        .route("/webrtc/{app}/{stream}", post(live::webrtc))
        .route("/{app}/{file}", get(live::http_stream))
        .route("/{app}/{stream}/{file}", get(live::hls))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn stream_key(app: &str, stream: &str) -> AppResult<StreamKey> {
    Ok(StreamKey::new(app, stream)?)
}

/// Request bodies are parsed here rather than through `Json` so malformed
/// input gets the same error body as everything else.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    Ok(serde_json::from_slice(body)?)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn server_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.as_ref().clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    use super::*;

    pub(crate) async fn app(root: &std::path::Path) -> (Router, Arc<SessionManager>) {
        let mut config = Config::default();
        config.recording.root = root.join("record").display().to_string();
        config.proxies.store_path = root.join("proxies.json").display().to_string();
        config.hls_storage.path = root.join("hls").display().to_string();
        let session = SessionManager::from_config(&config).await.unwrap();
        (create_router(Arc::clone(&session), Arc::new(config)), session)
    }

    pub(crate) async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        };
        router.clone().oneshot(request.unwrap()).await.unwrap()
    }

    pub(crate) async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _session) = app(dir.path()).await;

        let response = send(&router, "GET", "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, "GET", "/api/server/config", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["server"]["rtmp_port"], 1935);
    }
}
