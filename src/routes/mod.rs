//! API routes

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

use crate::conversation::Message;
use crate::core::{HistoryRecord, SubmitError, TurnState, TurnTicket};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Everything a renderer needs for one frame
#[derive(Debug, Serialize)]
pub struct ConversationView {
    /// Newest first
    pub messages: Vec<Message>,
    pub input_enabled: bool,
    pub turn_state: TurnState,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match self {
            SubmitError::BlankInput => return StatusCode::NO_CONTENT.into_response(),
            SubmitError::TurnInProgress => StatusCode::CONFLICT,
            SubmitError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn conversation(State(state): State<AppState>) -> Json<ConversationView> {
    let controller = state.session.controller();
    Json(ConversationView {
        messages: state.session.ledger().ordered_for_display().to_vec(),
        input_enabled: controller.input_enabled(),
        turn_state: controller.turn_state(),
    })
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<TurnTicket>), SubmitError> {
    let ticket = state.session.controller().submit(&request.text)?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn history(State(state): State<AppState>) -> Json<Vec<HistoryRecord>> {
    Json(state.session.history().await)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/messages", get(conversation).post(submit))
        .route("/v1/history", get(history))
}
