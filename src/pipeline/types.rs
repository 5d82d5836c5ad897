//! Shared types for the webhook ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::Channel;

const WHATSAPP_PREFIX: &str = "whatsapp:";
/// Twilio attaches at most ten media items to one message.
const MAX_MEDIA: usize = 10;

// ── Raw request ─────────────────────────────────────────────────────

/// A provider callback as received, before any interpretation.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Exact callback URL the provider signed.
    pub url: String,
    /// Signature header value, if the provider sent one.
    pub signature: Option<String>,
    /// Decoded form parameters in arrival order.
    pub params: Vec<(String, String)>,
}

impl WebhookRequest {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// ── Canonical inbound message ───────────────────────────────────────

/// Provider-independent shape of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    /// Provider-assigned id; the idempotency key.
    pub provider_message_id: String,
    pub channel: Channel,
    /// Sender address with any channel prefix removed.
    pub from: String,
    pub to: String,
    pub body: String,
    pub media_urls: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Canonicalize a Twilio-style form payload.
    ///
    /// `MessageSid` and `From` are required. Media URLs are the present
    /// `MediaUrl<N>` fields with `N < NumMedia`, in index order, capped at
    /// ten.
    pub fn from_request(request: &WebhookRequest) -> Result<Self, PipelineError> {
        let provider_message_id = request
            .param("MessageSid")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::Malformed("missing MessageSid".into()))?;
        let raw_from = request
            .param("From")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::Malformed("missing From".into()))?;

        let (channel, from) = match raw_from.strip_prefix(WHATSAPP_PREFIX) {
            Some(number) => (Channel::Whatsapp, number),
            None => (Channel::Sms, raw_from),
        };
        if from.is_empty() {
            return Err(PipelineError::Malformed("empty sender address".into()));
        }

        let num_media: usize = request
            .param("NumMedia")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0)
            .min(MAX_MEDIA);
        let mut indexed: Vec<(usize, &str)> = request
            .params
            .iter()
            .filter_map(|(k, v)| {
                let index = k.strip_prefix("MediaUrl")?.parse::<usize>().ok()?;
                (index < num_media && !v.is_empty()).then_some((index, v.as_str()))
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        indexed.dedup_by_key(|(index, _)| *index);
        let media_urls = indexed.into_iter().map(|(_, url)| url.to_string()).collect();

        let to = request.param("To").unwrap_or_default();

        Ok(Self {
            provider_message_id: provider_message_id.to_string(),
            channel,
            from: from.to_string(),
            to: to.strip_prefix(WHATSAPP_PREFIX).unwrap_or(to).to_string(),
            body: request.param("Body").unwrap_or_default().to_string(),
            media_urls,
            received_at: Utc::now(),
        })
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// What ingestion did with one callback.
///
/// Only `Rejected` is visible to the provider; every other outcome is
/// acknowledged identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded {
        message_id: Uuid,
        conversation_id: Uuid,
    },
    Duplicate {
        provider_message_id: String,
    },
    /// Signature present but invalid; nothing was read or written.
    Rejected,
    /// Internal failure, already logged.
    Failed {
        error: String,
    },
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Recorded { .. } => "recorded",
            IngestOutcome::Duplicate { .. } => "duplicate",
            IngestOutcome::Rejected => "rejected",
            IngestOutcome::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> WebhookRequest {
        WebhookRequest {
            url: "https://gateway.example.com/api/webhooks/twilio".into(),
            signature: None,
            params: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn sms_payload() {
        let msg = InboundMessage::from_request(&request(&[
            ("MessageSid", "SM1"),
            ("From", "+15551234567"),
            ("To", "+15550000000"),
            ("Body", "hello"),
            ("NumMedia", "0"),
        ]))
        .unwrap();
        assert_eq!(msg.channel, Channel::Sms);
        assert_eq!(msg.from, "+15551234567");
        assert_eq!(msg.body, "hello");
        assert!(msg.media_urls.is_empty());
    }

    #[test]
    fn whatsapp_prefix_selects_channel_and_is_stripped() {
        let msg = InboundMessage::from_request(&request(&[
            ("MessageSid", "SM2"),
            ("From", "whatsapp:+15551234567"),
            ("To", "whatsapp:+15550000001"),
            ("Body", "hola"),
        ]))
        .unwrap();
        assert_eq!(msg.channel, Channel::Whatsapp);
        assert_eq!(msg.from, "+15551234567");
        assert_eq!(msg.to, "+15550000001");
    }

    #[test]
    fn media_urls_follow_num_media() {
        let msg = InboundMessage::from_request(&request(&[
            ("MessageSid", "SM3"),
            ("From", "+15551234567"),
            ("NumMedia", "2"),
            ("MediaUrl0", "https://media.example.com/0"),
            ("MediaUrl1", "https://media.example.com/1"),
            ("MediaUrl2", "https://media.example.com/ignored"),
        ]))
        .unwrap();
        assert_eq!(
            msg.media_urls,
            vec!["https://media.example.com/0", "https://media.example.com/1"]
        );
        assert_eq!(msg.body, "");
    }

    #[test]
    fn garbage_num_media_means_none() {
        let msg = InboundMessage::from_request(&request(&[
            ("MessageSid", "SM4"),
            ("From", "+15551234567"),
            ("NumMedia", "lots"),
            ("MediaUrl0", "https://media.example.com/0"),
        ]))
        .unwrap();
        assert!(msg.media_urls.is_empty());
    }

    #[test]
    fn huge_num_media_reads_only_present_urls() {
        let started = std::time::Instant::now();
        let msg = InboundMessage::from_request(&request(&[
            ("MessageSid", "SM7"),
            ("From", "+15551234567"),
            ("NumMedia", "18446744073709551615"),
            ("MediaUrl3", "https://media.example.com/3"),
            ("MediaUrl0", "https://media.example.com/0"),
            ("MediaUrl42", "https://media.example.com/past-cap"),
        ]))
        .unwrap();
        assert_eq!(
            msg.media_urls,
            vec!["https://media.example.com/0", "https://media.example.com/3"]
        );
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn missing_required_fields() {
        let err = InboundMessage::from_request(&request(&[("From", "+15551234567")])).unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));

        let err = InboundMessage::from_request(&request(&[("MessageSid", "SM5")])).unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));

        let err = InboundMessage::from_request(&request(&[
            ("MessageSid", "SM6"),
            ("From", "whatsapp:"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
    }
}
