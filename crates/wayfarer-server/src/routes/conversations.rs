use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use wayfarer_memory::StoredMessage;

use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/{user_id}/messages", get(list_messages))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredMessage>>, StatusCode> {
    let store = state.gateway.orchestrator().store();
    let conversation = store
        .get_conversation(&user_id)
        .await
        .map_err(|e| {
            tracing::warn!(user_id = %user_id, "history lookup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let messages = store
        .fetch_last_messages(conversation.id, limit)
        .await
        .map_err(|e| {
            tracing::warn!(user_id = %user_id, "history fetch failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(messages))
}
