//! Contact and conversation resolution.
//!
//! Find-or-create for both entities is pushed into the store as
//! insert-or-fetch against unique constraints, so concurrent first contacts
//! from one address converge on the same contact and conversation.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{Contact, ContactAddress, Conversation};
use crate::store::Store;

/// Creator recorded on contacts created by inbound traffic.
pub const SYSTEM_USER: &str = "system";

pub struct ConversationResolver {
    store: Arc<dyn Store>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Inbound flow: the contact owning `address` and its conversation,
    /// creating either if absent. A new contact is named after its address.
    pub async fn resolve_address(
        &self,
        address: &ContactAddress,
    ) -> Result<(Contact, Conversation), DatabaseError> {
        let contact = match self.store.find_contact_by_address(address).await? {
            Some(contact) => contact,
            None => {
                let candidate = Contact::new(Uuid::new_v4().to_string(), SYSTEM_USER)
                    .with_name(address.as_str());
                let candidate = match address {
                    ContactAddress::Phone(phone) => candidate.with_phone(phone.as_str()),
                    ContactAddress::Email(email) => candidate.with_email(email.as_str()),
                };
                self.store.insert_contact_or_get(&candidate, address).await?
            }
        };

        let conversation = self.resolve_contact(&contact.id).await?;
        Ok((contact, conversation))
    }

    /// Outbound flow: the contact's conversation, created UNREAD if absent.
    pub async fn resolve_contact(&self, contact_id: &str) -> Result<Conversation, DatabaseError> {
        if let Some(conversation) = self.store.get_conversation_by_contact(contact_id).await? {
            return Ok(conversation);
        }
        self.store
            .get_or_create_conversation(contact_id, Utc::now())
            .await
    }
}
