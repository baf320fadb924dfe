use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use nexus_schema::ServerFrame;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::state::AppState;

#[derive(Deserialize)]
struct WsQuery {
    query: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/{session_id}", get(upgrade))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Accepts `{"query": ".."}` or a bare text message.
fn parse_query(text: &str) -> String {
    match serde_json::from_str::<WsQuery>(text) {
        Ok(parsed) => parsed.query.trim().to_string(),
        Err(_) => text.trim().to_string(),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}

async fn handle_socket(mut socket: WebSocket, state: AppState, session_id: String) {
    tracing::info!("websocket opened for session {session_id}");

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let query = parse_query(&text);
        if query.is_empty() {
            let frame = ServerFrame::Error {
                detail: "query must not be empty".to_string(),
            };
            if send_frame(&mut socket, &frame).await.is_err() {
                break;
            }
            continue;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::clone(&state.dispatcher);
        let sid = session_id.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .handle_query_with_progress(&query, &sid, Some(&tx))
                .await
        });

        // the channel closes when the dispatch task drops its sender
        while let Some(update) = rx.recv().await {
            if send_frame(&mut socket, &ServerFrame::Progress(update))
                .await
                .is_err()
            {
                tracing::info!("websocket for session {session_id} went away mid-request");
                return;
            }
        }

        let frame = match task.await {
            Ok(response) => ServerFrame::FinalResponse(response),
            Err(e) => {
                tracing::error!("dispatch task for session {session_id} failed: {e}");
                ServerFrame::Error {
                    detail: "the request could not be completed".to_string(),
                }
            }
        };
        if send_frame(&mut socket, &frame).await.is_err() {
            break;
        }
    }

    tracing::info!("websocket closed for session {session_id}");
}
