//! Webhook processor: verifies, canonicalizes and records inbound messages.
//!
//! Flow:
//! 1. Signature check (only when the provider sent a signature)
//! 2. Canonicalization into an `InboundMessage`
//! 3. Dedupe on the provider message id
//! 4. Contact/conversation resolution
//! 5. Message insert (the store bumps the conversation in the same statement)
//! 6. Best-effort analytics
//!
//! Internal failures never escape `ingest`; they are logged and reported as
//! `IngestOutcome::Failed` so the caller can acknowledge regardless.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::model::{AnalyticsEvent, ContactAddress, Message};
use crate::pipeline::signature::verify_signature;
use crate::pipeline::types::{InboundMessage, IngestOutcome, WebhookRequest};
use crate::resolver::ConversationResolver;
use crate::store::Store;

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    resolver: ConversationResolver,
    /// Shared secret for signature checks.
    secret: Option<SecretString>,
    timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn Store>, secret: Option<SecretString>, timeout: Duration) -> Self {
        Self {
            resolver: ConversationResolver::new(store.clone()),
            store,
            secret,
            timeout,
        }
    }

    /// Process one provider callback.
    pub async fn ingest(&self, request: &WebhookRequest) -> IngestOutcome {
        if let Err(e) = self.authenticate(request) {
            warn!(url = %request.url, "Rejecting webhook: {e}");
            return IngestOutcome::Rejected;
        }

        let outcome = match tokio::time::timeout(self.timeout, self.record(request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "Webhook ingestion failed");
                IngestOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(_) => {
                let e = PipelineError::Timeout(self.timeout);
                error!(error = %e, "Webhook ingestion failed");
                IngestOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        debug!(outcome = outcome.label(), "Webhook processed");
        outcome
    }

    /// Permissive when no signature was sent; strict otherwise.
    fn authenticate(&self, request: &WebhookRequest) -> Result<(), PipelineError> {
        let Some(signature) = request.signature.as_deref() else {
            debug!("Webhook carries no signature; skipping verification");
            return Ok(());
        };
        let Some(secret) = &self.secret else {
            error!("Webhook is signed but no signing secret is configured");
            return Err(PipelineError::SignatureInvalid);
        };
        if verify_signature(
            secret.expose_secret(),
            &request.url,
            &request.params,
            signature,
        ) {
            Ok(())
        } else {
            Err(PipelineError::SignatureInvalid)
        }
    }

    async fn record(&self, request: &WebhookRequest) -> Result<IngestOutcome, PipelineError> {
        let inbound = InboundMessage::from_request(request)?;

        if self
            .store
            .find_inbound_message(&inbound.provider_message_id)
            .await?
            .is_some()
        {
            info!(provider_id = %inbound.provider_message_id, "Duplicate webhook ignored");
            return Ok(IngestOutcome::Duplicate {
                provider_message_id: inbound.provider_message_id,
            });
        }

        let address = ContactAddress::Phone(inbound.from.clone());
        let (contact, conversation) = self.resolver.resolve_address(&address).await?;

        let mut message = Message::inbound(
            &conversation,
            inbound.channel,
            inbound.body,
            inbound.provider_message_id.clone(),
            inbound.media_urls,
        );
        message.created_at = inbound.received_at;

        // A concurrent delivery of the same callback may win between the
        // lookup above and this insert; the unique index settles it.
        if !self.store.insert_inbound_message(&message).await? {
            info!(provider_id = %inbound.provider_message_id, "Duplicate webhook ignored");
            return Ok(IngestOutcome::Duplicate {
                provider_message_id: inbound.provider_message_id,
            });
        }

        info!(
            message_id = %message.id,
            contact_id = %contact.id,
            channel = %message.channel,
            "Inbound message recorded"
        );

        if let Err(e) = self
            .store
            .record_event(&AnalyticsEvent::for_message(&message))
            .await
        {
            warn!(message_id = %message.id, "Failed to record analytics event: {e}");
        }

        Ok(IngestOutcome::Recorded {
            message_id: message.id,
            conversation_id: conversation.id,
        })
    }
}
