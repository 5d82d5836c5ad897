//! Inbound webhook ingestion.
//!
//! Provider callbacks flow through:
//! 1. `signature`: authenticity check against the shared secret
//! 2. `types::InboundMessage::from_request`: canonicalization
//! 3. `IngestionPipeline::ingest`: dedupe, resolution, persistence
//!
//! The HTTP layer acknowledges every outcome except a bad signature.

pub mod processor;
pub mod signature;
pub mod types;

pub use processor::IngestionPipeline;
pub use types::{InboundMessage, IngestOutcome, WebhookRequest};
