use super::state::AppState;
use crate::session::{SessionStats, TranscriptSegment, TranscriptionEvent};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    /// Reference material appended to the agent's instructions
    pub extra_context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub status: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub status: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /session/connect
/// Open a session; no-op when one is already open
pub async fn connect(
    State(state): State<AppState>,
    body: Option<Json<ConnectRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    if !state.manager.state().is_active() {
        state.transcript().clear();
    }

    let transcript = state.transcript.clone();
    let on_transcript = move |event: TranscriptionEvent| {
        transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(event);
    };

    match state.manager.connect(on_transcript, req.extra_context).await {
        Ok(()) => {
            let session_id = state.manager.stats().session_id.map(|id| id.to_string());
            info!("Session connected: {:?}", session_id);
            (
                StatusCode::OK,
                Json(ConnectResponse {
                    status: "connected".to_string(),
                    session_id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to connect: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: format!("Connection failed: {}", e),
                }),
            )
                .into_response()
        }
    }
}

/// POST /session/disconnect
/// Tear the session down; safe to call in any state
pub async fn disconnect(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.manager.disconnect().await;
    info!("Session ended after {:.1}s", stats.duration_secs);

    (
        StatusCode::OK,
        Json(DisconnectResponse {
            status: "ended".to_string(),
            stats,
        }),
    )
}

/// GET /session/status
pub async fn session_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.manager.stats()))
}

/// GET /session/transcript
/// Finalized turns of the current session
pub async fn session_transcript(State(state): State<AppState>) -> impl IntoResponse {
    let turns: Vec<TranscriptSegment> = state.transcript().turns();
    (StatusCode::OK, Json(turns))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
