use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState, require_cron_key, require_user};
use crate::error::ValidationReason;
use crate::model::ScheduleStatus;
use crate::scheduled::CreateScheduledRequest;

pub(super) async fn list_scheduled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers).await?;

    let status = match query.get("status").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<ScheduleStatus>().map_err(|_| {
            ApiError::validation(
                ValidationReason::InvalidStatus,
                format!("Unknown status: {raw}"),
            )
        })?),
        None => None,
    };

    let messages = state.schedules.list(status).await?;
    Ok(Json(serde_json::json!({ "scheduledMessages": messages })))
}

pub(super) async fn create_scheduled(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateScheduledRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let Json(request) =
        body.map_err(|e| ApiError::validation(ValidationReason::InvalidRequest, e.body_text()))?;

    let view = state.schedules.create(&user.id, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "scheduledMessage": view })),
    ))
}

pub(super) async fn cancel_scheduled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers).await?;
    let id = Uuid::parse_str(&id).map_err(|_| {
        ApiError::validation(ValidationReason::InvalidRequest, "Invalid scheduled message ID")
    })?;

    state.schedules.cancel(id).await?;
    info!(scheduled_id = %id, user_id = %user.id, "Scheduled message cancelled");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Delivery trigger. Guarded by the shared cron key, not user auth.
pub(super) async fn process_scheduled(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_cron_key(&state, &headers)?;
    let report = state.engine.run_batch().await?;
    Ok(Json(report))
}
