//! Email channel: outbound SMTP via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::{ChannelSender, OutboundPayload, SendResult};
use crate::error::ConfigError;
use crate::model::Channel;

const DEFAULT_SUBJECT: &str = "New message";

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok().filter(|s| !s.is_empty())?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            from_address,
            timeout: Duration::from_secs(15),
        })
    }
}

// ── Sender ──────────────────────────────────────────────────────────

/// Email sender. The provider message id is the generated `Message-ID`.
pub struct SmtpEmailSender {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpEmailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_FROM_ADDRESS".into(),
                message: format!("{e}"),
            })?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout))
            .build();

        Ok(Self { transport, from })
    }

    fn message_id(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4(), self.from.email.domain())
    }

    fn build(&self, payload: &OutboundPayload, message_id: &str) -> Result<Message, String> {
        let from = match payload.from.as_deref() {
            Some(addr) => addr
                .parse::<Mailbox>()
                .map_err(|e| format!("Invalid from address: {e}"))?,
            None => self.from.clone(),
        };
        let to: Mailbox = payload
            .to
            .parse()
            .map_err(|e| format!("Invalid to address: {e}"))?;

        let (subject, body) = extract_subject(&payload.content);
        let mut body = body.to_string();
        if !payload.media_urls.is_empty() {
            body.push_str("\n\n");
            body.push_str(&payload.media_urls.join("\n"));
        }

        Message::builder()
            .message_id(Some(message_id.to_string()))
            .from(from)
            .to(to)
            .subject(subject)
            .body(body)
            .map_err(|e| format!("Failed to build email: {e}"))
    }
}

#[async_trait]
impl ChannelSender for SmtpEmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn validate_recipient(&self, address: &str) -> bool {
        address.parse::<Address>().is_ok()
    }

    async fn send(&self, payload: &OutboundPayload) -> SendResult {
        let message_id = self.message_id();
        let email = match self.build(payload, &message_id) {
            Ok(email) => email,
            Err(e) => return SendResult::failed(e),
        };

        // SmtpTransport is blocking.
        let transport = self.transport.clone();
        let sent = tokio::task::spawn_blocking(move || transport.send(&email)).await;

        match sent {
            Ok(Ok(_)) => {
                tracing::info!(to = %payload.to, %message_id, "Email sent");
                SendResult::Sent {
                    provider_message_id: message_id,
                }
            }
            Ok(Err(e)) => SendResult::failed(format!("SMTP send failed: {e}")),
            Err(e) => SendResult::failed(format!("SMTP task failed: {e}")),
        }
    }
}

/// Split outgoing content into subject and body.
///
/// If content starts with `Subject: ...`, that line is the subject and the
/// rest is the body. Otherwise a default subject is used.
pub fn extract_subject(content: &str) -> (String, &str) {
    if let Some(rest) = content.strip_prefix("Subject: ")
        && let Some(pos) = rest.find('\n')
    {
        return (rest[..pos].trim().to_string(), rest[pos + 1..].trim_start());
    }
    (DEFAULT_SUBJECT.to_string(), content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> SmtpEmailSender {
        let config = SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            username: "gateway".into(),
            password: SecretString::from("pw".to_string()),
            from_address: "Inbox <inbox@example.com>".into(),
            timeout: Duration::from_secs(1),
        };
        SmtpEmailSender::new(&config).unwrap()
    }

    #[test]
    fn validates_addresses() {
        let s = sender();
        assert!(s.validate_recipient("alice@example.com"));
        assert!(!s.validate_recipient("alice"));
        assert!(!s.validate_recipient("+15551234567"));
    }

    #[test]
    fn subject_extraction() {
        let (subject, body) = extract_subject("Subject: Invoice\n\nPlease pay.");
        assert_eq!(subject, "Invoice");
        assert_eq!(body, "Please pay.");

        let (subject, body) = extract_subject("Just a note");
        assert_eq!(subject, DEFAULT_SUBJECT);
        assert_eq!(body, "Just a note");
    }

    #[test]
    fn message_id_uses_sender_domain() {
        let id = sender().message_id();
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.com>"));
    }

    #[test]
    fn invalid_from_address_is_config_error() {
        let config = SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            username: String::new(),
            password: SecretString::from(String::new()),
            from_address: "not an address".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            SmtpEmailSender::new(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_recipient_fails_before_connecting() {
        let result = sender()
            .send(&OutboundPayload::new("nobody", "hello"))
            .await;
        match result {
            SendResult::Failed { error } => assert!(error.contains("Invalid to address")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
