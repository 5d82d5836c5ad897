//! Scheduled-message authoring: create, list, cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ScheduleError, ValidationReason};
use crate::model::{Channel, Contact, ScheduleStatus, ScheduledMessage};
use crate::scheduled::lease_cutoff;
use crate::store::{CancelOutcome, Store};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduledRequest {
    pub contact_id: String,
    pub content: String,
    pub channel: Channel,
    pub send_at: DateTime<Utc>,
}

/// The contact fields shown alongside a scheduled message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactSummary {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl From<&Contact> for ContactSummary {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id.clone(),
            name: contact.name.clone(),
            phone: contact.phone.clone(),
            email: contact.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledMessageView {
    #[serde(flatten)]
    pub message: ScheduledMessage,
    pub contact: Option<ContactSummary>,
}

pub struct ScheduleService {
    store: Arc<dyn Store>,
    claim_lease: Duration,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn Store>, claim_lease: Duration) -> Self {
        Self { store, claim_lease }
    }

    pub async fn create(
        &self,
        user_id: &str,
        request: CreateScheduledRequest,
    ) -> Result<ScheduledMessageView, ScheduleError> {
        self.create_at(user_id, request, Utc::now()).await
    }

    /// Create a PENDING item; `send_at` must be strictly after `now`.
    pub async fn create_at(
        &self,
        user_id: &str,
        request: CreateScheduledRequest,
        now: DateTime<Utc>,
    ) -> Result<ScheduledMessageView, ScheduleError> {
        if request.contact_id.trim().is_empty() {
            return Err(ScheduleError::validation(
                ValidationReason::InvalidRequest,
                "contactId is required",
            ));
        }
        if request.content.is_empty() {
            return Err(ScheduleError::validation(
                ValidationReason::InvalidRequest,
                "content must not be empty",
            ));
        }
        if !request.channel.is_schedulable() {
            return Err(ScheduleError::validation(
                ValidationReason::ChannelNotSupported,
                format!("Channel {} cannot be scheduled", request.channel),
            ));
        }
        if request.send_at <= now {
            return Err(ScheduleError::validation(
                ValidationReason::SendTimeNotInFuture,
                "Send time must be in the future",
            ));
        }

        let contact = self
            .store
            .get_contact(&request.contact_id)
            .await?
            .ok_or_else(|| ScheduleError::ContactNotFound(request.contact_id.clone()))?;

        let mut message = ScheduledMessage::new(
            contact.id.as_str(),
            user_id,
            request.content,
            request.channel,
            request.send_at,
        );
        message.created_at = now;
        self.store.insert_scheduled(&message).await?;

        info!(
            scheduled_id = %message.id,
            contact_id = %contact.id,
            channel = %message.channel,
            send_at = %message.send_at,
            "Scheduled message created"
        );

        Ok(ScheduledMessageView {
            message,
            contact: Some(ContactSummary::from(&contact)),
        })
    }

    /// Items ordered by send time, each with its contact summary.
    pub async fn list(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduledMessageView>, ScheduleError> {
        let messages = self.store.list_scheduled(status).await?;

        let mut contacts: HashMap<String, Option<ContactSummary>> = HashMap::new();
        let mut views = Vec::with_capacity(messages.len());
        for message in messages {
            if !contacts.contains_key(&message.contact_id) {
                let summary = self
                    .store
                    .get_contact(&message.contact_id)
                    .await?
                    .as_ref()
                    .map(ContactSummary::from);
                contacts.insert(message.contact_id.clone(), summary);
            }
            let contact = contacts.get(&message.contact_id).cloned().flatten();
            views.push(ScheduledMessageView { message, contact });
        }
        Ok(views)
    }

    /// PENDING → CANCELLED. Fails for terminal items and items a delivery
    /// run currently holds.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ScheduleError> {
        let cutoff = lease_cutoff(Utc::now(), self.claim_lease);
        match self.store.cancel_scheduled(id, cutoff).await? {
            CancelOutcome::Cancelled => Ok(()),
            CancelOutcome::NotFound => Err(ScheduleError::NotFound(id)),
            CancelOutcome::NotPending(status) => Err(ScheduleError::NotPending { id, status }),
            CancelOutcome::Claimed => Err(ScheduleError::Claimed(id)),
        }
    }
}
