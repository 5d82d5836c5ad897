use axum::{
    Form, Json,
    extract::{OriginalUri, State, rejection::FormRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::AppState;
use crate::pipeline::signature::SIGNATURE_HEADER;
use crate::pipeline::{IngestOutcome, WebhookRequest};

/// Empty TwiML: acknowledges the callback without replying.
const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

/// Provider callback. Acknowledged with 200 whatever happens internally;
/// only a bad signature is refused.
pub(super) async fn twilio_webhook(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    form: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Response {
    let params = match form {
        Ok(Form(params)) => params,
        Err(e) => {
            warn!(error = %e, "Unreadable webhook body; acknowledging anyway");
            return acknowledge();
        }
    };

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = match &state.public_url {
        Some(base) => format!("{base}{path_and_query}"),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("localhost");
            format!("https://{host}{path_and_query}")
        }
    };

    let request = WebhookRequest {
        url,
        signature: headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        params,
    };

    match state.pipeline.ingest(&request).await {
        IngestOutcome::Rejected => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Invalid signature" })),
        )
            .into_response(),
        _ => acknowledge(),
    }
}

fn acknowledge() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        EMPTY_TWIML,
    )
        .into_response()
}
