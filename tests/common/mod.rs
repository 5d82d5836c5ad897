//! Shared harness: fake channel senders and a gateway on a random port.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::net::TcpListener;

use inbox_gateway::api::{self, AppState};
use inbox_gateway::channels::{ChannelSender, OutboundPayload, SendResult, SenderRegistry, TwilioConfig};
use inbox_gateway::config::{ApiToken, GatewayConfig};
use inbox_gateway::model::Channel;
use inbox_gateway::store::{LibSqlBackend, Store};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const USER_TOKEN: &str = "test-token";
pub const USER_ID: &str = "user_1";
pub const CRON_KEY: &str = "cron-secret";
pub const WEBHOOK_SECRET: &str = "webhook-secret";
pub const PUBLIC_URL: &str = "https://gw.example.com";

/// Records every payload. Content containing `FAIL` is rejected by the
/// "provider"; content containing `SLOW` stalls past any test deadline.
pub struct FakeSender {
    channel: Channel,
    sent: Mutex<Vec<OutboundPayload>>,
}

impl FakeSender {
    pub fn new(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<OutboundPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for FakeSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn validate_recipient(&self, address: &str) -> bool {
        match self.channel {
            Channel::Email => address.contains('@'),
            _ => address.starts_with('+'),
        }
    }

    async fn send(&self, payload: &OutboundPayload) -> SendResult {
        self.sent.lock().unwrap().push(payload.clone());
        if payload.content.contains("SLOW") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if payload.content.contains("FAIL") {
            return SendResult::failed("Provider rejected the message");
        }
        let n = self.sent.lock().unwrap().len();
        SendResult::Sent {
            provider_message_id: format!("{}-{n}", self.channel.as_str().to_lowercase()),
        }
    }
}

pub struct TestGateway {
    pub base: String,
    pub store: Arc<dyn Store>,
    pub sms: Arc<FakeSender>,
    pub email: Arc<FakeSender>,
    pub http: reqwest::Client,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a gateway on a random port after adjusting the default test config.
    pub async fn start_with(configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        let mut config = GatewayConfig {
            public_url: Some(PUBLIC_URL.into()),
            cron_api_key: Some(SecretString::from(CRON_KEY)),
            api_tokens: vec![ApiToken {
                token: SecretString::from(USER_TOKEN),
                user_id: USER_ID.into(),
            }],
            send_timeout: Duration::from_secs(1),
            twilio: Some(TwilioConfig::new("AC_test", WEBHOOK_SECRET)),
            ..GatewayConfig::default()
        };
        configure(&mut config);

        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sms = FakeSender::new(Channel::Sms);
        let email = FakeSender::new(Channel::Email);
        let senders = SenderRegistry::new()
            .with(sms.clone())
            .unwrap()
            .with(email.clone())
            .unwrap();

        let app = api::router(AppState::new(&config, store.clone(), senders));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            store,
            sms,
            email,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(USER_TOKEN)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(USER_TOKEN)
    }

    pub fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.delete(self.url(path)).bearer_auth(USER_TOKEN)
    }

    /// Fire the delivery trigger with the configured cron key.
    pub async fn trigger(&self) -> reqwest::Response {
        self.http
            .post(self.url("/api/scheduled-messages/process"))
            .header("x-api-key", CRON_KEY)
            .send()
            .await
            .unwrap()
    }
}

/// Form parameters of a typical inbound SMS callback.
pub fn inbound_sms(sid: &str, from: &str, body: &str) -> Vec<(String, String)> {
    [
        ("MessageSid", sid),
        ("AccountSid", "AC_test"),
        ("From", from),
        ("To", "+15550000000"),
        ("Body", body),
        ("NumMedia", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
