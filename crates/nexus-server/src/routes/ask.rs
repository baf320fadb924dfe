use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use nexus_schema::{AskRequest, FinalResponse};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(ask))
}

async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<FinalResponse>, (StatusCode, Json<Value>)> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "query must not be empty" })),
        ));
    }

    tracing::info!("ask from session {}", request.session_id);
    let response = state
        .dispatcher
        .handle_query(query, &request.session_id)
        .await;
    Ok(Json(response))
}
