//! Error types for the inbox gateway.

use std::time::Duration;

use uuid::Uuid;

use crate::model::{Channel, ScheduleStatus};

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel sender errors.
///
/// Provider rejections are not errors at this level; senders report them as
/// `SendResult::Failed`. These variants cover selection and the transport
/// boundary only.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Unsupported channel: {0}")]
    Unsupported(Channel),

    #[error("Channel {0} is not configured")]
    NotConfigured(Channel),

    #[error("Channel {channel} send timed out after {timeout:?}")]
    Timeout { channel: Channel, timeout: Duration },
}

/// Machine-readable validation failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    InvalidRequest,
    NoPhoneNumber,
    NoEmail,
    ChannelNotSupported,
    InvalidRecipient,
    InvalidMediaUrl,
    SendTimeNotInFuture,
    InvalidStatus,
    NotPending,
}

impl ValidationReason {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationReason::InvalidRequest => "invalid_request",
            ValidationReason::NoPhoneNumber => "no_phone_number",
            ValidationReason::NoEmail => "no_email",
            ValidationReason::ChannelNotSupported => "channel_not_supported",
            ValidationReason::InvalidRecipient => "invalid_recipient",
            ValidationReason::InvalidMediaUrl => "invalid_media_url",
            ValidationReason::SendTimeNotInFuture => "send_time_not_in_future",
            ValidationReason::InvalidStatus => "invalid_status",
            ValidationReason::NotPending => "not_pending",
        }
    }
}

/// Outbound send errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{message}")]
    Validation {
        reason: ValidationReason,
        message: String,
    },

    #[error("Contact {0} not found")]
    ContactNotFound(String),

    #[error("Failed to send message: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl DispatchError {
    pub fn validation(reason: ValidationReason, message: impl Into<String>) -> Self {
        DispatchError::Validation {
            reason,
            message: message.into(),
        }
    }
}

/// Scheduled-message errors (creation, listing, cancellation).
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("{message}")]
    Validation {
        reason: ValidationReason,
        message: String,
    },

    #[error("Contact {0} not found")]
    ContactNotFound(String),

    #[error("Scheduled message {0} not found")]
    NotFound(Uuid),

    #[error("Scheduled message {id} is {status}, only pending messages can be cancelled")]
    NotPending { id: Uuid, status: ScheduleStatus },

    #[error("Scheduled message {0} is being delivered and can no longer be cancelled")]
    Claimed(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ScheduleError {
    pub fn validation(reason: ValidationReason, message: impl Into<String>) -> Self {
        ScheduleError::Validation {
            reason,
            message: message.into(),
        }
    }
}

/// Webhook ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    Malformed(String),

    #[error("Ingestion timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
