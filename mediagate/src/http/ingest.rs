//! Port handoffs from signalling collaborators: a GB28181 SIP layer asks
//! for a PS-over-RTP port, anything else for a plain RTP port.

use axum::{body::Bytes, extract::State, Json};
use mediagate_core::{
    ingest::{gb28181::Gb28181Binding, rtp::RtpBinding},
    session::BoundPort,
};

use super::{parse_body, AppResult, AppState};

pub async fn bind_gb28181(State(state): State<AppState>, body: Bytes) -> AppResult<Json<BoundPort>> {
    let binding: Gb28181Binding = parse_body(&body)?;
    Ok(Json(state.session.bind_gb28181(binding).await?))
}

pub async fn bind_rtp(State(state): State<AppState>, body: Bytes) -> AppResult<Json<BoundPort>> {
    let binding: RtpBinding = parse_body(&body)?;
    Ok(Json(state.session.bind_rtp(binding).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::http::tests::{app, json, send};

    #[tokio::test]
    async fn test_gb28181_handoff_binds_a_port() {
        let dir = tempfile::tempdir().unwrap();
        let (router, session) = app(dir.path()).await;

        let request = json!({ "stream_key": "rtp/34020000001320000001" });
        let response = send(&router, "POST", "/api/ingest/gb28181", Some(request.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bound = json(response).await;
        let port = bound["port"].as_u64().unwrap();
        assert!((30_000..=30_500).contains(&port));
        assert!(!session.registry().is_empty());

        // one source per stream
        let response = send(&router, "POST", "/api/ingest/gb28181", Some(request)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(session.shutdown(std::time::Duration::from_secs(2)).await);
    }
}
