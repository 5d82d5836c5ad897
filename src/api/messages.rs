use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::HeaderMap,
    response::IntoResponse,
};
use tracing::info;

use super::{ApiError, AppState, require_user};
use crate::dispatch::SendRequest;
use crate::error::ValidationReason;

pub(super) async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let Json(request) =
        body.map_err(|e| ApiError::validation(ValidationReason::InvalidRequest, e.body_text()))?;

    let message = state.dispatcher.send(&user.id, request).await?;
    info!(message_id = %message.id, user_id = %user.id, "Outbound message sent via API");

    Ok(Json(serde_json::json!({
        "success": true,
        "message": message,
    })))
}
