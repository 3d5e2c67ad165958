use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, error};
use uuid::Uuid;

use hub_gateway::Identity;

use crate::auth::AppState;

/// Largest page a client may ask for.
const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: pass the id of the oldest message from the previous page to
    /// fetch older messages.
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

/// All rooms are public; any authenticated user may list them.
pub async fn list_channels(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let store = state.store.clone();
    let channels = tokio::task::spawn_blocking(move || store.list_channels())
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("Failed to list channels: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    debug!("{} listed {} channels", identity.email, channels.len());
    Ok(Json(channels))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(_identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let store = state.store.clone();
    let limit = query.limit.clamp(1, MAX_PAGE);
    let before = query.before;

    let messages = tokio::task::spawn_blocking(move || {
        if store.get_channel(channel_id)?.is_none() {
            return Ok(None);
        }
        store.list_messages(channel_id, limit, before).map(Some)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|e: anyhow::Error| { error!("Failed to list messages: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(messages))
}
