//! Channel sender abstraction.
//!
//! Every provider integration implements [`ChannelSender`]: one normalized
//! payload in, one [`SendResult`] out. Provider failures are values, never
//! `Err`, so callers can persist them. The [`SenderRegistry`] maps each
//! [`Channel`] variant to its sender and fails closed for the rest.

pub mod email;
pub mod twilio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, ConfigError};
use crate::model::Channel;

pub use email::{SmtpConfig, SmtpEmailSender};
pub use twilio::{TwilioClient, TwilioConfig, TwilioSmsSender, TwilioWhatsAppSender};

/// A normalized outbound message, ready for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPayload {
    /// Destination address in the channel's native format.
    pub to: String,
    pub content: String,
    /// Explicit sender address; the provider default is used when absent.
    pub from: Option<String>,
    pub media_urls: Vec<String>,
}

impl OutboundPayload {
    pub fn new(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: content.into(),
            from: None,
            media_urls: Vec::new(),
        }
    }

    /// Builder: attach media URLs.
    pub fn with_media(mut self, media_urls: Vec<String>) -> Self {
        self.media_urls = media_urls;
        self
    }

    /// Builder: override the sender address.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// Uniform provider outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendResult {
    Sent { provider_message_id: String },
    Failed { error: String },
}

impl SendResult {
    pub fn failed(error: impl Into<String>) -> Self {
        SendResult::Failed {
            error: error.into(),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendResult::Sent { .. })
    }
}

/// One provider integration for one channel.
///
/// `send` makes exactly one provider call and never retries.
/// `validate_recipient` must be checked before `send`.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// Channel-appropriate address syntax check.
    fn validate_recipient(&self, address: &str) -> bool;

    async fn send(&self, payload: &OutboundPayload) -> SendResult;
}

/// Exhaustive channel → sender table.
#[derive(Default, Clone)]
pub struct SenderRegistry {
    sms: Option<Arc<dyn ChannelSender>>,
    whatsapp: Option<Arc<dyn ChannelSender>>,
    email: Option<Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `sender` in the slot for the channel it reports.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) -> Result<(), ChannelError> {
        let channel = sender.channel();
        let slot = match channel {
            Channel::Sms => &mut self.sms,
            Channel::Whatsapp => &mut self.whatsapp,
            Channel::Email => &mut self.email,
            Channel::Twitter | Channel::Facebook => {
                return Err(ChannelError::Unsupported(channel));
            }
        };
        if slot.replace(sender).is_some() {
            tracing::warn!(channel = %channel, "Replacing previously registered sender");
        }
        Ok(())
    }

    /// Senders for every configured provider. Twilio channels need their
    /// sender number; email needs SMTP settings.
    pub fn from_providers(
        twilio: Option<&TwilioConfig>,
        smtp: Option<&SmtpConfig>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        if let Some(config) = twilio {
            let client = Arc::new(TwilioClient::new(config.clone()));
            if config.phone_number.is_some() {
                registry.install(Arc::new(TwilioSmsSender::new(client.clone())))?;
            }
            if config.whatsapp_number.is_some() {
                registry.install(Arc::new(TwilioWhatsAppSender::new(client)))?;
            }
        }
        if let Some(config) = smtp {
            registry.install(Arc::new(SmtpEmailSender::new(config)?))?;
        }

        tracing::info!(channels = ?registry.configured(), "Channel senders configured");
        Ok(registry)
    }

    fn install(&mut self, sender: Arc<dyn ChannelSender>) -> Result<(), ConfigError> {
        let channel = sender.channel();
        self.register(sender)
            .map_err(|e| ConfigError::InvalidValue {
                key: channel.to_string(),
                message: e.to_string(),
            })
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, sender: Arc<dyn ChannelSender>) -> Result<Self, ChannelError> {
        self.register(sender)?;
        Ok(self)
    }

    /// The sender for `channel`, failing closed for channels without one.
    pub fn select(&self, channel: Channel) -> Result<Arc<dyn ChannelSender>, ChannelError> {
        let slot = match channel {
            Channel::Sms => &self.sms,
            Channel::Whatsapp => &self.whatsapp,
            Channel::Email => &self.email,
            Channel::Twitter | Channel::Facebook => {
                return Err(ChannelError::Unsupported(channel));
            }
        };
        slot.clone().ok_or(ChannelError::NotConfigured(channel))
    }

    /// Channels with a registered sender.
    pub fn configured(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.select(*c).is_ok())
            .collect()
    }
}

/// Invoke `sender` with an enforced deadline.
///
/// Only an elapsed deadline is an `Err`; provider failures come back as
/// `SendResult::Failed`.
pub async fn dispatch(
    sender: &dyn ChannelSender,
    payload: &OutboundPayload,
    timeout: Duration,
) -> Result<SendResult, ChannelError> {
    match tokio::time::timeout(timeout, sender.send(payload)).await {
        Ok(result) => {
            if let SendResult::Failed { error } = &result {
                tracing::warn!(channel = %sender.channel(), to = %payload.to, "Provider rejected send: {error}");
            }
            Ok(result)
        }
        Err(_) => {
            tracing::warn!(channel = %sender.channel(), to = %payload.to, ?timeout, "Provider send timed out");
            Err(ChannelError::Timeout {
                channel: sender.channel(),
                timeout,
            })
        }
    }
}

/// Whether `url` is an absolute http(s) URL.
pub fn is_media_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}
