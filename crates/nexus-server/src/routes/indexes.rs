use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use nexus_memory::IndexSummary;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(summary))
        .route("/reload", post(reload))
}

async fn summary(State(state): State<AppState>) -> Json<IndexSummary> {
    Json(state.retrieval.summary())
}

async fn reload(State(state): State<AppState>) -> Result<Json<IndexSummary>, StatusCode> {
    match state.retrieval.reload().await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            tracing::error!("index reload failed: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use nexus_memory::{write_index, DistanceMetric, RetrievalRecord, StubEmbeddingProvider};
    use tower::ServiceExt;

    use super::router;
    use crate::state::testing::stub_state;

    #[tokio::test]
    async fn reload_picks_up_new_categories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = stub_state(tmp.path());
        assert!(state.retrieval.list_available_categories().is_empty());

        let embedder = StubEmbeddingProvider::new(384);
        write_index(
            &tmp.path().join("indexes/books/history"),
            DistanceMetric::Cosine,
            384,
            &[(RetrievalRecord::new("rome fell in 476"), embedder.vector_for("rome"))],
        )
        .unwrap();

        let response = router()
            .with_state(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["categories"]["history"], 1);
        assert_eq!(state.retrieval.list_available_categories(), vec!["history"]);
    }
}
