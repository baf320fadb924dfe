pub mod ask;
pub mod health;
pub mod indexes;
pub mod sessions;
pub mod ws;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/ask", ask::router())
        .nest("/health", health::router())
        .nest("/indexes", indexes::router())
        .nest("/sessions", sessions::router())
        .nest("/ws", ws::router())
}
