//! Delivery engine: advances due scheduled messages.
//!
//! One `run_batch` call per external trigger. Each due item is claimed with a
//! compare-and-swap before any provider call, so overlapping runs never send
//! the same item twice. Items are processed independently: a failure is
//! recorded against that item only.
//!
//! Terminal failures (provider rejection, missing address, unsupported
//! channel, invalid recipient, missing contact) move the item to FAILED.
//! Timeouts and store errors release the claim and leave it PENDING for the
//! next trigger.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{OutboundPayload, SendResult};
use crate::dispatch::OutboundDispatcher;
use crate::error::{DatabaseError, Error};
use crate::model::{Claim, Message, ScheduledMessage};
use crate::scheduled::lease_cutoff;
use crate::store::Store;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum items selected per run.
    pub batch_size: usize,
    /// Items processed at once within a run.
    pub concurrency: usize,
    /// Deadline for one item, from claim until the provider accepts it.
    pub item_timeout: Duration,
    /// Age after which another run may take over a claim. Must exceed
    /// `item_timeout`.
    pub claim_lease: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 4,
            item_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Sent,
    Failed,
    /// Not delivered this run; retried at the next trigger.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub id: Uuid,
    pub status: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    fn sent(id: Uuid) -> Self {
        Self {
            id,
            status: ItemOutcome::Sent,
            error: None,
        }
    }

    fn failed(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            status: ItemOutcome::Failed,
            error: Some(error.into()),
        }
    }

    fn error(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            status: ItemOutcome::Error,
            error: Some(error.into()),
        }
    }
}

/// Where an item stands when its pre-send deadline ends.
enum Attempt {
    /// Already terminal: failed, or the failure was recorded.
    Settled(ItemResult),
    /// The provider took the message.
    Accepted {
        contact_id: String,
        provider_message_id: String,
    },
}

/// Per-run report. Items lost to a concurrent run are not listed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub results: Vec<ItemResult>,
}

pub struct DeliveryEngine {
    store: Arc<dyn Store>,
    dispatcher: Arc<OutboundDispatcher>,
    config: EngineConfig,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<OutboundDispatcher>,
        config: EngineConfig,
    ) -> Self {
        if config.claim_lease <= config.item_timeout {
            warn!(
                lease = ?config.claim_lease,
                item_timeout = ?config.item_timeout,
                "Claim lease does not exceed the item timeout; slow items may be taken over"
            );
        }
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub async fn run_batch(&self) -> Result<BatchReport, DatabaseError> {
        self.run_batch_at(Utc::now()).await
    }

    /// Process up to `batch_size` items due at `now`, earliest first.
    ///
    /// Only a failure to select the batch is an `Err`; everything after that
    /// is reported per item.
    pub async fn run_batch_at(&self, now: DateTime<Utc>) -> Result<BatchReport, DatabaseError> {
        let cutoff = lease_cutoff(now, self.config.claim_lease);
        let due = self
            .store
            .list_due_scheduled(now, cutoff, self.config.batch_size)
            .await?;

        if due.is_empty() {
            debug!("No scheduled messages due");
            return Ok(BatchReport {
                processed: 0,
                results: Vec::new(),
            });
        }
        info!(count = due.len(), "Processing due scheduled messages");

        let results: Vec<ItemResult> = futures::stream::iter(due)
            .map(|item| self.process_item(item, now, cutoff))
            .buffered(self.config.concurrency.max(1))
            .filter_map(|result| async move { result })
            .collect()
            .await;

        let sent = results
            .iter()
            .filter(|r| r.status == ItemOutcome::Sent)
            .count();
        info!(
            processed = results.len(),
            sent,
            "Scheduled delivery run complete"
        );

        Ok(BatchReport {
            processed: results.len(),
            results,
        })
    }

    /// Claim and deliver one item. `None` when another run owns it.
    async fn process_item(
        &self,
        item: ScheduledMessage,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Option<ItemResult> {
        let claim = match self.store.claim_scheduled(item.id, now, cutoff).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                debug!(scheduled_id = %item.id, "Skipping item claimed by another run");
                return None;
            }
            Err(e) => {
                error!(scheduled_id = %item.id, error = %e, "Failed to claim scheduled message");
                return Some(ItemResult::error(item.id, e.to_string()));
            }
        };

        // The deadline covers only the work before the provider accepts the
        // message. Once accepted, the claim is never released.
        let attempt = tokio::time::timeout(self.config.item_timeout, self.attempt(&item, &claim))
            .await
            .unwrap_or(Err(Error::Timeout(self.config.item_timeout)));

        match attempt {
            Ok(Attempt::Settled(result)) => Some(result),
            Ok(Attempt::Accepted {
                contact_id,
                provider_message_id,
            }) => Some(
                self.complete_sent(&item, &claim, &contact_id, provider_message_id)
                    .await,
            ),
            Err(e) => {
                warn!(scheduled_id = %item.id, error = %e, "Scheduled delivery deferred");
                if let Err(release_err) = self.store.release_claim(&claim).await {
                    error!(scheduled_id = %item.id, error = %release_err, "Failed to release claim");
                }
                Some(ItemResult::error(item.id, e.to_string()))
            }
        }
    }

    /// Resolve, route and hand a claimed item to its provider. `Err` means
    /// retryable.
    async fn attempt(&self, item: &ScheduledMessage, claim: &Claim) -> Result<Attempt, Error> {
        let Some(contact) = self.store.get_contact(&item.contact_id).await? else {
            return self
                .fail(item, claim, format!("Contact {} not found", item.contact_id))
                .await
                .map(Attempt::Settled);
        };

        let route = match self.dispatcher.route(&contact, item.channel) {
            Ok(route) => route,
            Err(e) => return self.fail(item, claim, e.to_string()).await.map(Attempt::Settled),
        };

        let payload = OutboundPayload::new(route.to, item.content.as_str());
        match self
            .dispatcher
            .deliver(route.sender.as_ref(), &payload)
            .await?
        {
            SendResult::Sent {
                provider_message_id,
            } => Ok(Attempt::Accepted {
                contact_id: contact.id,
                provider_message_id,
            }),
            SendResult::Failed { error } => {
                self.fail(item, claim, error).await.map(Attempt::Settled)
            }
        }
    }

    /// Record an accepted send. Nothing here may make the item retryable.
    async fn complete_sent(
        &self,
        item: &ScheduledMessage,
        claim: &Claim,
        contact_id: &str,
        provider_message_id: String,
    ) -> ItemResult {
        match self.store.mark_scheduled_sent(claim, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(scheduled_id = %item.id, "Claim lost after send; status left to its new owner");
            }
            Err(e) => {
                error!(scheduled_id = %item.id, error = %e, "Sent scheduled message could not be marked SENT");
                return ItemResult {
                    error: Some(format!("sent but status not recorded: {e}")),
                    ..ItemResult::sent(item.id)
                };
            }
        }

        match self.record_delivery(item, contact_id, provider_message_id).await {
            Ok(message) => {
                info!(scheduled_id = %item.id, message_id = %message.id, "Scheduled message sent");
                ItemResult::sent(item.id)
            }
            Err(e) => {
                error!(scheduled_id = %item.id, error = %e, "Sent scheduled message could not be recorded");
                ItemResult {
                    error: Some(format!("sent but not recorded: {e}")),
                    ..ItemResult::sent(item.id)
                }
            }
        }
    }

    async fn record_delivery(
        &self,
        item: &ScheduledMessage,
        contact_id: &str,
        provider_message_id: String,
    ) -> Result<Message, DatabaseError> {
        let conversation = self.dispatcher.resolver().resolve_contact(contact_id).await?;
        self.dispatcher
            .record_outbound(
                &conversation,
                &item.user_id,
                item.channel,
                item.content.clone(),
                provider_message_id,
                Vec::new(),
            )
            .await
    }

    async fn fail(
        &self,
        item: &ScheduledMessage,
        claim: &Claim,
        error: String,
    ) -> Result<ItemResult, Error> {
        if self.store.mark_scheduled_failed(claim, &error).await? {
            warn!(scheduled_id = %item.id, "Scheduled message failed: {error}");
        } else {
            warn!(scheduled_id = %item.id, "Claim lost before recording failure: {error}");
        }
        Ok(ItemResult::failed(item.id, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelSender, SenderRegistry};
    use crate::model::{
        AnalyticsEvent, Channel, Contact, ContactAddress, Conversation, ConversationStatus,
        Direction, ScheduleStatus,
    };
    use crate::store::{CancelOutcome, LibSqlBackend};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    /// Fails payloads whose content is "fail"; sleeps on "slow".
    struct ScriptedSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelSender for ScriptedSender {
        fn channel(&self) -> Channel {
            Channel::Sms
        }

        fn validate_recipient(&self, address: &str) -> bool {
            address.starts_with('+')
        }

        async fn send(&self, payload: &OutboundPayload) -> SendResult {
            if payload.content == "slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.sent.lock().unwrap().push(payload.content.clone());
            if payload.content == "fail" {
                return SendResult::failed("carrier rejected");
            }
            SendResult::Sent {
                provider_message_id: format!("SM-{}", payload.content),
            }
        }
    }

    struct Fixture {
        engine: DeliveryEngine,
        store: Arc<dyn Store>,
        sender: Arc<ScriptedSender>,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        fixture_on(config, store).await
    }

    async fn fixture_on(config: EngineConfig, store: Arc<dyn Store>) -> Fixture {
        store
            .insert_contact(&Contact::new("c1", "user_1").with_phone("+15551234567"))
            .await
            .unwrap();
        store
            .insert_contact(&Contact::new("mail", "user_1").with_email("a@example.com"))
            .await
            .unwrap();

        let sender = Arc::new(ScriptedSender {
            sent: Mutex::new(Vec::new()),
        });
        let senders = SenderRegistry::new().with(sender.clone()).unwrap();
        let dispatcher = Arc::new(OutboundDispatcher::new(
            store.clone(),
            senders,
            Duration::from_secs(1),
        ));
        Fixture {
            engine: DeliveryEngine::new(store.clone(), dispatcher, config),
            store,
            sender,
        }
    }

    async fn schedule(
        store: &Arc<dyn Store>,
        contact_id: &str,
        content: &str,
        minutes_ago: i64,
    ) -> ScheduledMessage {
        let item = ScheduledMessage::new(
            contact_id,
            "user_1",
            content,
            Channel::Sms,
            Utc::now() - ChronoDuration::minutes(minutes_ago),
        );
        store.insert_scheduled(&item).await.unwrap();
        item
    }

    async fn status_of(store: &Arc<dyn Store>, id: Uuid) -> ScheduleStatus {
        store.get_scheduled(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn middle_failure_is_isolated() {
        let f = fixture(EngineConfig {
            concurrency: 1,
            ..EngineConfig::default()
        })
        .await;
        let first = schedule(&f.store, "c1", "one", 3).await;
        let second = schedule(&f.store, "c1", "fail", 2).await;
        let third = schedule(&f.store, "c1", "three", 1).await;

        let report = f.engine.run_batch().await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(
            report.results,
            vec![
                ItemResult::sent(first.id),
                ItemResult::failed(second.id, "carrier rejected"),
                ItemResult::sent(third.id),
            ]
        );

        assert_eq!(status_of(&f.store, first.id).await, ScheduleStatus::Sent);
        assert_eq!(status_of(&f.store, second.id).await, ScheduleStatus::Failed);
        assert_eq!(status_of(&f.store, third.id).await, ScheduleStatus::Sent);
        assert_eq!(
            *f.sender.sent.lock().unwrap(),
            vec!["one", "fail", "three"]
        );

        // Only the successful items produced messages.
        let conversation = f.store.get_conversation_by_contact("c1").await.unwrap().unwrap();
        let messages = f.store.list_conversation_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.direction == Direction::Outbound));
    }

    #[tokio::test]
    async fn batch_is_capped_and_earliest_first() {
        let f = fixture(EngineConfig::default()).await;
        let mut items = Vec::new();
        for i in 0..12 {
            items.push(schedule(&f.store, "c1", &format!("m{i}"), 60 - i).await);
        }

        let report = f.engine.run_batch().await.unwrap();
        assert_eq!(report.processed, 10);
        let ids: Vec<_> = report.results.iter().map(|r| r.id).collect();
        let expected: Vec<_> = items.iter().take(10).map(|i| i.id).collect();
        assert_eq!(ids, expected);

        let rest = f.engine.run_batch().await.unwrap();
        assert_eq!(rest.processed, 2);
    }

    #[tokio::test]
    async fn missing_address_is_terminal() {
        let f = fixture(EngineConfig::default()).await;
        let item = schedule(&f.store, "mail", "hi", 1).await;

        let report = f.engine.run_batch().await.unwrap();
        assert_eq!(report.results[0].status, ItemOutcome::Failed);
        assert_eq!(
            report.results[0].error.as_deref(),
            Some("Contact has no phone number")
        );

        let stored = f.store.get_scheduled(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("Contact has no phone number"));
        assert!(f.sender.sent.lock().unwrap().is_empty());

        // Terminal: a second run does not pick it up again.
        assert_eq!(f.engine.run_batch().await.unwrap().processed, 0);
    }

    #[tokio::test]
    async fn timeout_releases_claim_for_next_run() {
        let f = fixture(EngineConfig::default()).await;
        let item = schedule(&f.store, "c1", "slow", 1).await;

        let report = f.engine.run_batch().await.unwrap();
        assert_eq!(report.results[0].status, ItemOutcome::Error);
        assert_eq!(status_of(&f.store, item.id).await, ScheduleStatus::Pending);

        let now = Utc::now();
        let due = f
            .store
            .list_due_scheduled(now, now - ChronoDuration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    /// Delegates to an in-memory backend but takes `delay` to mark SENT.
    struct SlowMarkStore {
        inner: LibSqlBackend,
        delay: Duration,
    }

    #[async_trait]
    impl Store for SlowMarkStore {
        async fn init_schema(&self) -> Result<(), DatabaseError> {
            self.inner.init_schema().await
        }
        async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
            self.inner.insert_contact(contact).await
        }
        async fn get_contact(&self, id: &str) -> Result<Option<Contact>, DatabaseError> {
            self.inner.get_contact(id).await
        }
        async fn find_contact_by_address(
            &self,
            address: &ContactAddress,
        ) -> Result<Option<Contact>, DatabaseError> {
            self.inner.find_contact_by_address(address).await
        }
        async fn insert_contact_or_get(
            &self,
            contact: &Contact,
            address: &ContactAddress,
        ) -> Result<Contact, DatabaseError> {
            self.inner.insert_contact_or_get(contact, address).await
        }
        async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
            self.inner.get_conversation(id).await
        }
        async fn get_conversation_by_contact(
            &self,
            contact_id: &str,
        ) -> Result<Option<Conversation>, DatabaseError> {
            self.inner.get_conversation_by_contact(contact_id).await
        }
        async fn get_or_create_conversation(
            &self,
            contact_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Conversation, DatabaseError> {
            self.inner.get_or_create_conversation(contact_id, now).await
        }
        async fn set_conversation_status(
            &self,
            id: Uuid,
            status: ConversationStatus,
        ) -> Result<(), DatabaseError> {
            self.inner.set_conversation_status(id, status).await
        }
        async fn insert_inbound_message(&self, message: &Message) -> Result<bool, DatabaseError> {
            self.inner.insert_inbound_message(message).await
        }
        async fn insert_outbound_message(&self, message: &Message) -> Result<(), DatabaseError> {
            self.inner.insert_outbound_message(message).await
        }
        async fn find_inbound_message(
            &self,
            provider_message_id: &str,
        ) -> Result<Option<Message>, DatabaseError> {
            self.inner.find_inbound_message(provider_message_id).await
        }
        async fn list_conversation_messages(
            &self,
            conversation_id: Uuid,
        ) -> Result<Vec<Message>, DatabaseError> {
            self.inner.list_conversation_messages(conversation_id).await
        }
        async fn insert_scheduled(&self, message: &ScheduledMessage) -> Result<(), DatabaseError> {
            self.inner.insert_scheduled(message).await
        }
        async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError> {
            self.inner.get_scheduled(id).await
        }
        async fn list_scheduled(
            &self,
            status: Option<ScheduleStatus>,
        ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
            self.inner.list_scheduled(status).await
        }
        async fn list_due_scheduled(
            &self,
            now: DateTime<Utc>,
            lease_cutoff: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
            self.inner.list_due_scheduled(now, lease_cutoff, limit).await
        }
        async fn claim_scheduled(
            &self,
            id: Uuid,
            now: DateTime<Utc>,
            lease_cutoff: DateTime<Utc>,
        ) -> Result<Option<Claim>, DatabaseError> {
            self.inner.claim_scheduled(id, now, lease_cutoff).await
        }
        async fn mark_scheduled_sent(
            &self,
            claim: &Claim,
            sent_at: DateTime<Utc>,
        ) -> Result<bool, DatabaseError> {
            tokio::time::sleep(self.delay).await;
            self.inner.mark_scheduled_sent(claim, sent_at).await
        }
        async fn mark_scheduled_failed(
            &self,
            claim: &Claim,
            error: &str,
        ) -> Result<bool, DatabaseError> {
            self.inner.mark_scheduled_failed(claim, error).await
        }
        async fn release_claim(&self, claim: &Claim) -> Result<bool, DatabaseError> {
            self.inner.release_claim(claim).await
        }
        async fn cancel_scheduled(
            &self,
            id: Uuid,
            lease_cutoff: DateTime<Utc>,
        ) -> Result<CancelOutcome, DatabaseError> {
            self.inner.cancel_scheduled(id, lease_cutoff).await
        }
        async fn record_event(&self, event: &AnalyticsEvent) -> Result<(), DatabaseError> {
            self.inner.record_event(event).await
        }
        async fn list_events_for_contact(
            &self,
            contact_id: &str,
        ) -> Result<Vec<AnalyticsEvent>, DatabaseError> {
            self.inner.list_events_for_contact(contact_id).await
        }
    }

    #[tokio::test]
    async fn slow_bookkeeping_after_acceptance_never_resends() {
        let store: Arc<dyn Store> = Arc::new(SlowMarkStore {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            delay: Duration::from_millis(400),
        });
        let f = fixture_on(
            EngineConfig {
                item_timeout: Duration::from_millis(150),
                ..EngineConfig::default()
            },
            store,
        )
        .await;
        let item = schedule(&f.store, "c1", "once", 1).await;

        let first = f.engine.run_batch().await.unwrap();
        assert_eq!(first.results, vec![ItemResult::sent(item.id)]);
        assert_eq!(status_of(&f.store, item.id).await, ScheduleStatus::Sent);

        let second = f.engine.run_batch().await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(*f.sender.sent.lock().unwrap(), vec!["once"]);
    }

    #[tokio::test]
    async fn cancelled_and_future_items_are_skipped() {
        let f = fixture(EngineConfig::default()).await;
        let cancelled = schedule(&f.store, "c1", "x", 1).await;
        f.store
            .cancel_scheduled(cancelled.id, Utc::now())
            .await
            .unwrap();
        let future = ScheduledMessage::new(
            "c1",
            "user_1",
            "later",
            Channel::Sms,
            Utc::now() + ChronoDuration::hours(1),
        );
        f.store.insert_scheduled(&future).await.unwrap();

        let report = f.engine.run_batch().await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(f.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_runs_send_each_item_once() {
        let f = fixture(EngineConfig::default()).await;
        for i in 0..6 {
            schedule(&f.store, "c1", &format!("m{i}"), 10 - i).await;
        }

        let (a, b) = tokio::join!(f.engine.run_batch(), f.engine.run_batch());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.processed + b.processed, 6);

        let mut sent = f.sender.sent.lock().unwrap().clone();
        sent.sort();
        sent.dedup();
        assert_eq!(sent.len(), 6);
        assert_eq!(f.sender.sent.lock().unwrap().len(), 6);
    }

    #[test]
    fn report_wire_format() {
        let id = Uuid::new_v4();
        let report = BatchReport {
            processed: 2,
            results: vec![ItemResult::sent(id), ItemResult::failed(id, "nope")],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["processed"], 2);
        assert_eq!(json["results"][0]["status"], "sent");
        assert!(json["results"][0].get("error").is_none());
        assert_eq!(json["results"][1]["status"], "failed");
        assert_eq!(json["results"][1]["error"], "nope");
    }
}
