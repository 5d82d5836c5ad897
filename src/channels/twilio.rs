//! Twilio channel: SMS and WhatsApp over the Programmable Messaging REST API.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{ChannelSender, OutboundPayload, SendResult};
use crate::model::Channel;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";
const WHATSAPP_PREFIX: &str = "whatsapp:";

static E164: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("E.164 pattern compiles"));

/// Whether `number` is a phone number in E.164 syntax.
pub fn is_e164(number: &str) -> bool {
    E164.is_match(number)
}

// ── Configuration ───────────────────────────────────────────────────

/// Twilio account configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    /// API credential and webhook signing secret.
    pub auth_token: SecretString,
    pub phone_number: Option<String>,
    pub whatsapp_number: Option<String>,
    pub api_base: String,
}

impl TwilioConfig {
    /// Build config from environment variables.
    /// Returns `None` if `TWILIO_ACCOUNT_SID` or `TWILIO_AUTH_TOKEN` is unset.
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID")
            .ok()
            .filter(|s| !s.is_empty())?;
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())?;

        let non_empty = |key: &str| std::env::var(key).ok().filter(|s| !s.trim().is_empty());

        Some(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            phone_number: non_empty("TWILIO_PHONE_NUMBER"),
            whatsapp_number: non_empty("TWILIO_WHATSAPP_NUMBER"),
            api_base: non_empty("TWILIO_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: SecretString::from(auth_token.into()),
            phone_number: None,
            whatsapp_number: None,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

// ── REST client ─────────────────────────────────────────────────────

/// Minimal client for the Messages resource.
pub struct TwilioClient {
    config: TwilioConfig,
    http: reqwest::Client,
}

impl TwilioClient {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &TwilioConfig {
        &self.config
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    /// Create one outbound message. Exactly one HTTP request, no retries.
    pub async fn create_message(
        &self,
        from: &str,
        to: &str,
        body: &str,
        media_urls: &[String],
    ) -> SendResult {
        let mut form: Vec<(&str, &str)> = vec![("From", from), ("To", to), ("Body", body)];
        for url in media_urls {
            form.push(("MediaUrl", url.as_str()));
        }

        let resp = match self
            .http
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return SendResult::failed(format!("Twilio request failed: {e}")),
        };

        let status = resp.status();
        let json: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                return SendResult::failed(format!("Twilio returned {status} with unreadable body: {e}"));
            }
        };

        if !status.is_success() {
            let message = json
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return SendResult::failed(format!("Twilio error {status}: {message}"));
        }

        match json.get("sid").and_then(|s| s.as_str()) {
            Some(sid) => {
                tracing::info!(sid, to, "Twilio message created");
                SendResult::Sent {
                    provider_message_id: sid.to_string(),
                }
            }
            None => SendResult::failed("Twilio response missing message sid"),
        }
    }
}

fn whatsapp_address(number: &str) -> String {
    if number.starts_with(WHATSAPP_PREFIX) {
        number.to_string()
    } else {
        format!("{WHATSAPP_PREFIX}{number}")
    }
}

// ── Senders ─────────────────────────────────────────────────────────

/// SMS via Twilio.
pub struct TwilioSmsSender {
    client: Arc<TwilioClient>,
}

impl TwilioSmsSender {
    pub fn new(client: Arc<TwilioClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for TwilioSmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn validate_recipient(&self, address: &str) -> bool {
        is_e164(address)
    }

    async fn send(&self, payload: &OutboundPayload) -> SendResult {
        let Some(from) = payload
            .from
            .as_deref()
            .or(self.client.config().phone_number.as_deref())
        else {
            return SendResult::failed("No Twilio sender number configured for SMS");
        };
        self.client
            .create_message(from, &payload.to, &payload.content, &payload.media_urls)
            .await
    }
}

/// WhatsApp via Twilio. Addresses are sent as `whatsapp:<E.164>`.
pub struct TwilioWhatsAppSender {
    client: Arc<TwilioClient>,
}

impl TwilioWhatsAppSender {
    pub fn new(client: Arc<TwilioClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for TwilioWhatsAppSender {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn validate_recipient(&self, address: &str) -> bool {
        is_e164(address.strip_prefix(WHATSAPP_PREFIX).unwrap_or(address))
    }

    async fn send(&self, payload: &OutboundPayload) -> SendResult {
        let Some(from) = payload
            .from
            .as_deref()
            .or(self.client.config().whatsapp_number.as_deref())
        else {
            return SendResult::failed("No Twilio sender number configured for WhatsApp");
        };
        self.client
            .create_message(
                &whatsapp_address(from),
                &whatsapp_address(&payload.to),
                &payload.content,
                &payload.media_urls,
            )
            .await
    }
}
