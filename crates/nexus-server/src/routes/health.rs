use axum::{extract::State, routing::get, Json, Router};
use nexus_memory::IndexSummary;
use nexus_provider::PoolStatus;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub pools: Vec<PoolStatus>,
    pub indexes: IndexSummary,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let pools = state.router.pool_statuses().await;
    // degraded when some pool has every credential cooling down
    let status = if pools.iter().any(|p| p.size > 0 && p.available == 0) {
        "degraded"
    } else {
        "ok"
    };
    Json(Health {
        status,
        pools,
        indexes: state.retrieval.summary(),
    })
}
