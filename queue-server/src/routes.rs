//! API route handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::AppState;

/// `GET /api/sessions/{session_id}/queue`: current queue state.
#[tracing::instrument(name = "get_session_queue", skip(state))]
pub async fn get_session_queue(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.rooms.get_queue_state(&session_id).await {
        Some(queue) => Json(queue).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("Session not found: {session_id}")
            })),
        )
            .into_response(),
    }
}
