//! Gateway data model: contacts, conversations, messages, scheduled sends.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationReason;

/// A messaging transport.
///
/// Closed set: every variant must appear in the sender dispatch table, even
/// the ones that have no implementation yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Sms,
    Whatsapp,
    Email,
    Twitter,
    Facebook,
}

/// Which contact field a channel delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Phone,
    Email,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Sms,
        Channel::Whatsapp,
        Channel::Email,
        Channel::Twitter,
        Channel::Facebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "SMS",
            Channel::Whatsapp => "WHATSAPP",
            Channel::Email => "EMAIL",
            Channel::Twitter => "TWITTER",
            Channel::Facebook => "FACEBOOK",
        }
    }

    /// The contact field this channel addresses, or `None` for channels with
    /// no addressing scheme yet.
    pub fn address_kind(&self) -> Option<AddressKind> {
        match self {
            Channel::Sms | Channel::Whatsapp => Some(AddressKind::Phone),
            Channel::Email => Some(AddressKind::Email),
            Channel::Twitter | Channel::Facebook => None,
        }
    }

    /// Channels a scheduled message may target.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Channel::Sms | Channel::Whatsapp | Channel::Email)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}

/// Conversation inbox state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationStatus {
    Unread,
    Read,
    Archived,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Unread => "UNREAD",
            ConversationStatus::Read => "READ",
            ConversationStatus::Archived => "ARCHIVED",
            ConversationStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNREAD" => Ok(ConversationStatus::Unread),
            "READ" => Ok(ConversationStatus::Read),
            "ARCHIVED" => Ok(ConversationStatus::Archived),
            "RESOLVED" => Ok(ConversationStatus::Resolved),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INBOUND" => Ok(Direction::Inbound),
            "OUTBOUND" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Provider delivery state of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "QUEUED",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(DeliveryStatus::Queued),
            "SENT" => Ok(DeliveryStatus::Sent),
            "DELIVERED" => Ok(DeliveryStatus::Delivered),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Scheduled message lifecycle. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduleStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "PENDING",
            ScheduleStatus::Sent => "SENT",
            ScheduleStatus::Failed => "FAILED",
            ScheduleStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScheduleStatus::Pending)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ScheduleStatus::Pending),
            "SENT" => Ok(ScheduleStatus::Sent),
            "FAILED" => Ok(ScheduleStatus::Failed),
            "CANCELLED" => Ok(ScheduleStatus::Cancelled),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A person or organization being messaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: Option<String>,
    /// E.164 phone number.
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_by_id: String,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(id: impl Into<String>, created_by_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            phone: None,
            email: None,
            created_by_id: created_by_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Builder: set display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder: set phone number.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Builder: set email address.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// The destination address for `channel`.
    ///
    /// Fails with the reason a send to this contact on this channel must be
    /// rejected before any provider is contacted.
    pub fn address_for(&self, channel: Channel) -> Result<&str, ValidationReason> {
        match channel.address_kind() {
            Some(AddressKind::Phone) => self
                .phone
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or(ValidationReason::NoPhoneNumber),
            Some(AddressKind::Email) => self
                .email
                .as_deref()
                .filter(|e| !e.is_empty())
                .ok_or(ValidationReason::NoEmail),
            None => Err(ValidationReason::ChannelNotSupported),
        }
    }
}

/// An address a contact can be found by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactAddress {
    Phone(String),
    Email(String),
}

impl ContactAddress {
    pub fn as_str(&self) -> &str {
        match self {
            ContactAddress::Phone(s) | ContactAddress::Email(s) => s,
        }
    }
}

/// The single ongoing thread with one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub contact_id: String,
    pub status: ConversationStatus,
    pub last_message_at: DateTime<Utc>,
}

/// One unit of communication, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub contact_id: String,
    /// Sending user; absent for inbound messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub content: String,
    pub channel: Channel,
    pub direction: Direction,
    pub status: DeliveryStatus,
    /// Provider-assigned id; the idempotency key for inbound messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A message received from a contact, as recorded by webhook ingestion.
    pub fn inbound(
        conversation: &Conversation,
        channel: Channel,
        content: impl Into<String>,
        provider_message_id: impl Into<String>,
        attachments: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            contact_id: conversation.contact_id.clone(),
            user_id: None,
            content: content.into(),
            channel,
            direction: Direction::Inbound,
            status: DeliveryStatus::Delivered,
            provider_message_id: Some(provider_message_id.into()),
            attachments,
            created_at: Utc::now(),
        }
    }

    /// A message accepted by a provider on behalf of `user_id`.
    pub fn outbound(
        conversation: &Conversation,
        user_id: impl Into<String>,
        channel: Channel,
        content: impl Into<String>,
        provider_message_id: Option<String>,
        attachments: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            contact_id: conversation.contact_id.clone(),
            user_id: Some(user_id.into()),
            content: content.into(),
            channel,
            direction: Direction::Outbound,
            status: DeliveryStatus::Sent,
            provider_message_id,
            attachments,
            created_at: Utc::now(),
        }
    }
}

/// A deferred outbound send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub contact_id: String,
    /// Authoring user.
    pub user_id: String,
    pub content: String,
    pub channel: Channel,
    pub send_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Failure detail for FAILED items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        contact_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
        channel: Channel,
        send_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: contact_id.into(),
            user_id: user_id.into(),
            content: content.into(),
            channel,
            send_at,
            status: ScheduleStatus::Pending,
            sent_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Proof that one delivery-engine invocation owns a scheduled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub id: Uuid,
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    MessageSent,
    MessageReceived,
}

impl AnalyticsEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsEventType::MessageSent => "message_sent",
            AnalyticsEventType::MessageReceived => "message_received",
        }
    }
}

/// Best-effort analytics record emitted alongside message writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub contact_id: String,
    pub conversation_id: Uuid,
    pub channel: Channel,
    pub event_type: AnalyticsEventType,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn for_message(message: &Message) -> Self {
        let event_type = match message.direction {
            Direction::Inbound => AnalyticsEventType::MessageReceived,
            Direction::Outbound => AnalyticsEventType::MessageSent,
        };
        Self {
            contact_id: message.contact_id.clone(),
            conversation_id: message.conversation_id,
            channel: message.channel,
            event_type,
            timestamp: message.created_at,
        }
    }
}
