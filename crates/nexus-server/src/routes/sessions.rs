use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use nexus_memory::ConversationStats;
use nexus_schema::HistoryEntry;
use serde::Deserialize;

use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 15;

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{session_id}/stats", get(session_stats))
        .route("/{session_id}/history", get(session_history))
}

async fn session_stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ConversationStats>, StatusCode> {
    state
        .store
        .conversation_stats(&session_id)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("failed to read stats for session {session_id}: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, StatusCode> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let turns = state
        .store
        .last_n_turns(&session_id, limit)
        .await
        .map_err(|e| {
            tracing::error!("failed to read history for session {session_id}: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(turns.iter().map(HistoryEntry::from).collect()))
}
