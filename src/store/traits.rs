//! Unified `Store` trait: the single async interface the gateway's
//! components use for all persistence.
//!
//! Every cross-invocation invariant is enforced here, by the backend, through
//! unique constraints and conditional updates. Components never cache rows
//! across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    AnalyticsEvent, Claim, Contact, ContactAddress, Conversation, ConversationStatus, Message,
    ScheduleStatus, ScheduledMessage,
};

/// Result of a conditional cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The item is already terminal.
    NotPending(ScheduleStatus),
    /// The item is pending but a delivery run holds a live claim on it.
    Claimed,
}

/// Backend-agnostic persistence for contacts, conversations, messages and
/// scheduled messages.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Insert a contact. Fails with `Constraint` if its id, phone or email
    /// is already taken.
    async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError>;

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, DatabaseError>;

    async fn find_contact_by_address(
        &self,
        address: &ContactAddress,
    ) -> Result<Option<Contact>, DatabaseError>;

    /// Insert `contact` unless a contact already owns `address`, then return
    /// whichever contact owns it. Safe under concurrent first contact.
    async fn insert_contact_or_get(
        &self,
        contact: &Contact,
        address: &ContactAddress,
    ) -> Result<Contact, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    async fn get_conversation_by_contact(
        &self,
        contact_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Return the contact's conversation, creating it (UNREAD, last activity
    /// `now`) if none exists. At most one conversation per contact is ever
    /// created, regardless of concurrent callers.
    async fn get_or_create_conversation(
        &self,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, DatabaseError>;

    async fn set_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Record an inbound message and bump its conversation atomically.
    ///
    /// Returns `false` (and writes nothing) if an inbound message with the
    /// same provider id already exists.
    async fn insert_inbound_message(&self, message: &Message) -> Result<bool, DatabaseError>;

    /// Record an outbound message and bump its conversation's timestamp.
    async fn insert_outbound_message(&self, message: &Message) -> Result<(), DatabaseError>;

    async fn find_inbound_message(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;

    /// Messages of a conversation, oldest first.
    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, DatabaseError>;

    // ── Scheduled messages ──────────────────────────────────────────

    async fn insert_scheduled(&self, message: &ScheduledMessage) -> Result<(), DatabaseError>;

    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError>;

    /// Scheduled messages ordered by send time, optionally filtered by status.
    async fn list_scheduled(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// Up to `limit` PENDING items due at `now`, earliest first, skipping
    /// items under a claim taken after `lease_cutoff`.
    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// Atomically claim a PENDING item for delivery.
    ///
    /// Succeeds only if the item is still PENDING and unclaimed (or its
    /// previous claim predates `lease_cutoff`). `None` means another run owns
    /// it or it left PENDING.
    async fn claim_scheduled(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<Claim>, DatabaseError>;

    /// PENDING → SENT, conditional on still holding `claim`.
    async fn mark_scheduled_sent(
        &self,
        claim: &Claim,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// PENDING → FAILED, conditional on still holding `claim`.
    async fn mark_scheduled_failed(&self, claim: &Claim, error: &str)
    -> Result<bool, DatabaseError>;

    /// Drop a claim so the item is retried by the next run.
    async fn release_claim(&self, claim: &Claim) -> Result<bool, DatabaseError>;

    /// PENDING → CANCELLED unless claimed under a live lease.
    async fn cancel_scheduled(
        &self,
        id: Uuid,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<CancelOutcome, DatabaseError>;

    // ── Analytics ───────────────────────────────────────────────────

    async fn record_event(&self, event: &AnalyticsEvent) -> Result<(), DatabaseError>;

    async fn list_events_for_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<AnalyticsEvent>, DatabaseError>;
}
