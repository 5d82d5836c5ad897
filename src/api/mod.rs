//! HTTP surface: outbound send, provider webhook, scheduled messages,
//! delivery trigger, health.

mod error;
mod messages;
mod scheduled;
mod webhooks;

pub use error::ApiError;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::{HeaderMap, header::AUTHORIZATION},
    response::IntoResponse,
    routing::{delete, get, post},
};
use secrecy::SecretString;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{AuthUser, Authenticator, StaticTokenAuth, secret_eq};
use crate::channels::SenderRegistry;
use crate::config::GatewayConfig;
use crate::dispatch::OutboundDispatcher;
use crate::error::ConfigError;
use crate::pipeline::IngestionPipeline;
use crate::scheduled::{DeliveryEngine, ScheduleService};
use crate::store::Store;

/// Header carrying the delivery trigger's shared secret.
pub const CRON_KEY_HEADER: &str = "x-api-key";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<dyn Authenticator>,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub schedules: Arc<ScheduleService>,
    pub engine: Arc<DeliveryEngine>,
    pub pipeline: Arc<IngestionPipeline>,
    /// Unset rejects every trigger call.
    pub cron_api_key: Option<SecretString>,
    /// Public base URL used to rebuild signed webhook URLs.
    pub public_url: Option<String>,
}

impl AppState {
    /// Wire every component around `store` with the given senders.
    pub fn new(config: &GatewayConfig, store: Arc<dyn Store>, senders: SenderRegistry) -> Self {
        let dispatcher = Arc::new(OutboundDispatcher::new(
            store.clone(),
            senders,
            config.send_timeout,
        ));
        let webhook_secret = config.twilio.as_ref().map(|t| t.auth_token.clone());

        Self {
            auth: Arc::new(StaticTokenAuth::new(config.api_tokens.clone())),
            schedules: Arc::new(ScheduleService::new(
                store.clone(),
                config.engine.claim_lease,
            )),
            engine: Arc::new(DeliveryEngine::new(
                store.clone(),
                dispatcher.clone(),
                config.engine.clone(),
            )),
            pipeline: Arc::new(IngestionPipeline::new(
                store,
                webhook_secret,
                config.webhook_timeout,
            )),
            dispatcher,
            cron_api_key: config.cron_api_key.clone(),
            public_url: config.public_url.clone(),
        }
    }

    /// Wire the gateway with senders for every configured provider.
    pub fn from_config(config: &GatewayConfig, store: Arc<dyn Store>) -> Result<Self, ConfigError> {
        let senders = SenderRegistry::from_providers(config.twilio.as_ref(), config.smtp.as_ref())?;
        Ok(Self::new(config, store, senders))
    }
}

/// Build the Axum router with every gateway route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages/send", post(messages::send_message))
        .route("/api/webhooks/twilio", post(webhooks::twilio_webhook))
        .route(
            "/api/scheduled-messages",
            get(scheduled::list_scheduled).post(scheduled::create_scheduled),
        )
        .route(
            "/api/scheduled-messages/process",
            post(scheduled::process_scheduled),
        )
        .route(
            "/api/scheduled-messages/{id}",
            delete(scheduled::cancel_scheduled),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-gateway"
    }))
}

/// Resolve the caller from `Authorization: Bearer <token>`.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(ApiError::unauthorized)?;

    state
        .auth
        .authenticate(token)
        .await
        .ok_or_else(ApiError::unauthorized)
}

/// Check the delivery trigger's shared secret.
fn require_cron_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.cron_api_key else {
        warn!("Delivery trigger called but CRON_API_KEY is not set");
        return Err(ApiError::unauthorized());
    };
    let presented = headers
        .get(CRON_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if secret_eq(expected, presented) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn app(cron_key: Option<&str>) -> Router {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = GatewayConfig {
            cron_api_key: cron_key.map(SecretString::from),
            ..GatewayConfig::default()
        };
        router(AppState::new(&config, store, SenderRegistry::new()))
    }

    #[tokio::test]
    async fn health_is_public() {
        let resp = app(None)
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn user_routes_need_bearer_token() {
        let resp = app(None)
            .await
            .oneshot(
                Request::get("/api/scheduled-messages")
                    .header(AUTHORIZATION, "Basic dXNlcjpwYXNz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_checks_cron_key() {
        let app = app(Some("k1")).await;
        let wrong = app
            .clone()
            .oneshot(
                Request::post("/api/scheduled-messages/process")
                    .header(CRON_KEY_HEADER, "k2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let right = app
            .oneshot(
                Request::post("/api/scheduled-messages/process")
                    .header(CRON_KEY_HEADER, "k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(right.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_without_form_is_acknowledged() {
        let resp = app(None)
            .await
            .oneshot(
                Request::post("/api/webhooks/twilio")
                    .body(Body::from("garbage"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
