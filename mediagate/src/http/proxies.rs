use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use mediagate_core::session::{PullProxy, DEFAULT_VHOST};
use serde::Deserialize;

use super::{parse_body, stream_key, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VhostQuery {
    vhost: Option<String>,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<PullProxy>> {
    Json(state.session.proxies().list())
}

/// Adds or replaces a proxy; a proxy that is not on demand starts pulling
/// right away.
pub async fn create(State(state): State<AppState>, body: Bytes) -> AppResult<(StatusCode, Json<PullProxy>)> {
    let proxy: PullProxy = parse_body(&body)?;
    let stored = state.session.create_pull(proxy).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn remove(
    State(state): State<AppState>,
    Path((app, stream)): Path<(String, String)>,
    Query(query): Query<VhostQuery>,
) -> AppResult<Json<PullProxy>> {
    let key = stream_key(&app, &stream)?;
    let vhost = query.vhost.as_deref().unwrap_or(DEFAULT_VHOST);
    Ok(Json(state.session.remove_pull(vhost, &key).await?))
}
