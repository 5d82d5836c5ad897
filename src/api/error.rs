//! Mapping from domain errors to HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::error::{DatabaseError, DispatchError, ScheduleError, ValidationReason};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// An error ready to be rendered as `{error, reason, details}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                reason: None,
                details: None,
            },
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn validation(reason: ValidationReason, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message).with_reason(reason.code())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message).with_reason("not_found")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// Store failures and anything else the caller cannot act on.
    pub fn internal(err: &dyn std::fmt::Display) -> Self {
        error!(error = %err, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }

    fn with_reason(mut self, reason: &'static str) -> Self {
        self.body.reason = Some(reason);
        self
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.body.details = Some(details.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::internal(&err)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation { reason, message } => ApiError::validation(reason, message),
            DispatchError::ContactNotFound(_) => ApiError::not_found("Contact not found"),
            DispatchError::Provider(detail) => {
                error!(detail = %detail, "Provider rejected outbound message");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send message")
                    .with_reason("provider_failure")
                    .with_details(detail)
            }
            DispatchError::Database(e) => ApiError::internal(&e),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Validation { reason, message } => ApiError::validation(reason, message),
            ScheduleError::ContactNotFound(_) => ApiError::not_found("Contact not found"),
            e @ ScheduleError::NotFound(_) => ApiError::not_found(e.to_string()),
            e @ (ScheduleError::NotPending { .. } | ScheduleError::Claimed(_)) => {
                ApiError::validation(ValidationReason::NotPending, e.to_string())
            }
            ScheduleError::Database(e) => ApiError::internal(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScheduleStatus;
    use uuid::Uuid;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_carries_reason_code() {
        let err = ApiError::from(DispatchError::validation(
            ValidationReason::NoPhoneNumber,
            "Contact has no phone number",
        ));
        let (status, json) = body_json(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Contact has no phone number");
        assert_eq!(json["reason"], "no_phone_number");
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn provider_failure_is_500_with_details() {
        let err = ApiError::from(DispatchError::Provider("number blocked".into()));
        let (status, json) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["details"], "number blocked");
    }

    #[tokio::test]
    async fn store_failure_hides_detail() {
        let err = ApiError::from(DatabaseError::Query("disk I/O error".into()));
        let (status, json) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Internal server error");
        assert!(!json.to_string().contains("disk"));
    }

    #[test]
    fn schedule_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(ScheduleError::NotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ScheduleError::NotPending {
                id,
                status: ScheduleStatus::Sent
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ScheduleError::Claimed(id)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ScheduleError::ContactNotFound("c9".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
