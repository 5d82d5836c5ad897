//! Outbound dispatch: validate, route to a channel sender, persist.
//!
//! Shared by user-initiated sends and the scheduled delivery engine; the two
//! differ only in how they treat failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::{self, ChannelSender, OutboundPayload, SendResult, SenderRegistry};
use crate::error::{ChannelError, DatabaseError, DispatchError, ValidationReason};
use crate::model::{AnalyticsEvent, Channel, Contact, Conversation, Message};
use crate::resolver::ConversationResolver;
use crate::store::Store;

/// A user-initiated send.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub contact_id: String,
    pub content: String,
    pub channel: Channel,
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Overrides the provider's default sender address.
    #[serde(default)]
    pub from: Option<String>,
}

/// Summary of a persisted outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub id: Uuid,
    pub content: String,
    pub channel: Channel,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for SentMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            content: message.content.clone(),
            channel: message.channel,
            created_at: message.created_at,
        }
    }
}

/// A validated destination: the sender to use and the address to send to.
pub struct Route {
    pub sender: Arc<dyn ChannelSender>,
    pub to: String,
}

pub struct OutboundDispatcher {
    store: Arc<dyn Store>,
    resolver: ConversationResolver,
    senders: SenderRegistry,
    send_timeout: Duration,
}

impl OutboundDispatcher {
    pub fn new(store: Arc<dyn Store>, senders: SenderRegistry, send_timeout: Duration) -> Self {
        Self {
            resolver: ConversationResolver::new(store.clone()),
            store,
            senders,
            send_timeout,
        }
    }

    pub fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    /// Send `request` on behalf of `user_id`.
    ///
    /// Validation failures happen before any provider call. A provider
    /// failure is returned as `DispatchError::Provider` and nothing is
    /// persisted.
    pub async fn send(
        &self,
        user_id: &str,
        request: SendRequest,
    ) -> Result<SentMessage, DispatchError> {
        if request.contact_id.trim().is_empty() {
            return Err(DispatchError::validation(
                ValidationReason::InvalidRequest,
                "contactId is required",
            ));
        }
        if request.content.is_empty() {
            return Err(DispatchError::validation(
                ValidationReason::InvalidRequest,
                "content must not be empty",
            ));
        }
        if let Some(bad) = request
            .media_urls
            .iter()
            .find(|url| !channels::is_media_url(url))
        {
            return Err(DispatchError::validation(
                ValidationReason::InvalidMediaUrl,
                format!("Invalid media URL: {bad}"),
            ));
        }

        let contact = self
            .store
            .get_contact(&request.contact_id)
            .await?
            .ok_or_else(|| DispatchError::ContactNotFound(request.contact_id.clone()))?;

        let route = self.route(&contact, request.channel)?;
        let conversation = self.resolver.resolve_contact(&contact.id).await?;

        let mut payload = OutboundPayload::new(route.to, request.content.as_str())
            .with_media(request.media_urls.clone());
        payload.from = request.from;

        let provider_message_id = match self.deliver(route.sender.as_ref(), &payload).await {
            Ok(SendResult::Sent {
                provider_message_id,
            }) => provider_message_id,
            Ok(SendResult::Failed { error }) => return Err(DispatchError::Provider(error)),
            Err(e) => return Err(DispatchError::Provider(e.to_string())),
        };

        let message = self
            .record_outbound(
                &conversation,
                user_id,
                request.channel,
                request.content,
                provider_message_id,
                request.media_urls,
            )
            .await?;

        Ok(SentMessage::from(&message))
    }

    /// Pick the sender and destination address for `contact` on `channel`.
    pub fn route(&self, contact: &Contact, channel: Channel) -> Result<Route, DispatchError> {
        let to = contact.address_for(channel).map_err(|reason| {
            let message = match reason {
                ValidationReason::NoPhoneNumber => "Contact has no phone number".to_string(),
                ValidationReason::NoEmail => "Contact has no email".to_string(),
                _ => format!("Channel {channel} not yet supported"),
            };
            DispatchError::validation(reason, message)
        })?;

        let sender = self.senders.select(channel).map_err(|e| match e {
            ChannelError::NotConfigured(_) => DispatchError::validation(
                ValidationReason::ChannelNotSupported,
                format!("Channel {channel} is not configured"),
            ),
            other => DispatchError::validation(
                ValidationReason::ChannelNotSupported,
                format!("{other}"),
            ),
        })?;

        if !sender.validate_recipient(to) {
            return Err(DispatchError::validation(
                ValidationReason::InvalidRecipient,
                format!("Invalid {channel} recipient: {to}"),
            ));
        }

        Ok(Route {
            sender,
            to: to.to_string(),
        })
    }

    /// One provider call under the configured deadline.
    pub async fn deliver(
        &self,
        sender: &dyn ChannelSender,
        payload: &OutboundPayload,
    ) -> Result<SendResult, ChannelError> {
        channels::dispatch(sender, payload, self.send_timeout).await
    }

    /// Persist a provider-accepted message and emit its analytics event.
    pub async fn record_outbound(
        &self,
        conversation: &Conversation,
        user_id: &str,
        channel: Channel,
        content: String,
        provider_message_id: String,
        attachments: Vec<String>,
    ) -> Result<Message, DatabaseError> {
        let message = Message::outbound(
            conversation,
            user_id,
            channel,
            content,
            Some(provider_message_id),
            attachments,
        );
        self.store.insert_outbound_message(&message).await?;

        info!(
            message_id = %message.id,
            contact_id = %message.contact_id,
            channel = %channel,
            "Outbound message recorded"
        );

        if let Err(e) = self
            .store
            .record_event(&AnalyticsEvent::for_message(&message))
            .await
        {
            warn!(message_id = %message.id, "Failed to record analytics event: {e}");
        }

        Ok(message)
    }
}
