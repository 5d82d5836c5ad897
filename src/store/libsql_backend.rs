//! libSQL backend: async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Invariants that must hold
//! across concurrent invocations are pushed down into single SQL statements:
//! `INSERT OR IGNORE` against unique constraints for find-or-create, and
//! compare-and-swap `UPDATE ... WHERE` for scheduled-item state transitions.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    AnalyticsEvent, AnalyticsEventType, Claim, Contact, ContactAddress, Conversation,
    ConversationStatus, Message, ScheduleStatus, ScheduledMessage,
};
use crate::store::migrations;
use crate::store::traits::{CancelOutcome, Store};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    ///
    /// `busy_timeout` bounds how long a statement waits on a locked database
    /// before failing.
    pub async fn new_local(path: &Path, busy_timeout: Duration) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.set_busy_timeout(busy_timeout).await?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn set_busy_timeout(&self, timeout: Duration) -> Result<(), DatabaseError> {
        let pragma = format!("PRAGMA busy_timeout = {}", timeout.as_millis());
        let mut rows = self
            .conn()
            .query(&pragma, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("busy_timeout: {e}")))?;
        // Drain the single result row the pragma echoes back.
        while let Ok(Some(_)) = rows.next().await {}
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 UTC, so that text
/// comparison in SQL orders timestamps correctly.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(field: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "{field}: invalid timestamp {s:?}"
    )))
}

fn parse_optional_datetime(
    field: &str,
    s: &Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(|s| parse_datetime(field, s)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(field: &str, s: &str) -> Result<T, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn parse_uuid(field: &str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn col<T>(field: &str, value: Result<T, libsql::Error>) -> Result<T, DatabaseError> {
    value.map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

/// Convert `Option<&str>` to libsql Value, normalizing empty strings to NULL.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) if !s.is_empty() => libsql::Value::Text(s.to_string()),
        _ => libsql::Value::Null,
    }
}

/// Classify a write failure, surfacing unique-constraint hits as `Constraint`.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

/// Map a libsql Row to a Contact. Column order matches CONTACT_COLUMNS.
fn row_to_contact(row: &libsql::Row) -> Result<Contact, DatabaseError> {
    let created_str: String = col("contact.created_at", row.get(5))?;
    Ok(Contact {
        id: col("contact.id", row.get(0))?,
        name: row.get(1).ok(),
        phone: row.get(2).ok(),
        email: row.get(3).ok(),
        created_by_id: col("contact.created_by_id", row.get(4))?,
        created_at: parse_datetime("contact.created_at", &created_str)?,
    })
}

/// Map a libsql Row to a Conversation. Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let id_str: String = col("conversation.id", row.get(0))?;
    let status_str: String = col("conversation.status", row.get(2))?;
    let last_str: String = col("conversation.last_message_at", row.get(3))?;
    Ok(Conversation {
        id: parse_uuid("conversation.id", &id_str)?,
        contact_id: col("conversation.contact_id", row.get(1))?,
        status: parse_enum("conversation.status", &status_str)?,
        last_message_at: parse_datetime("conversation.last_message_at", &last_str)?,
    })
}

/// Map a libsql Row to a Message. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id_str: String = col("message.id", row.get(0))?;
    let conversation_str: String = col("message.conversation_id", row.get(1))?;
    let channel_str: String = col("message.channel", row.get(5))?;
    let direction_str: String = col("message.direction", row.get(6))?;
    let status_str: String = col("message.status", row.get(7))?;
    let attachments_str: Option<String> = row.get(9).ok();
    let created_str: String = col("message.created_at", row.get(10))?;

    let attachments = match attachments_str {
        Some(s) if !s.is_empty() => serde_json::from_str(&s)
            .map_err(|e| DatabaseError::Serialization(format!("message.attachments: {e}")))?,
        _ => Vec::new(),
    };

    Ok(Message {
        id: parse_uuid("message.id", &id_str)?,
        conversation_id: parse_uuid("message.conversation_id", &conversation_str)?,
        contact_id: col("message.contact_id", row.get(2))?,
        user_id: row.get(3).ok(),
        content: col("message.content", row.get(4))?,
        channel: parse_enum("message.channel", &channel_str)?,
        direction: parse_enum("message.direction", &direction_str)?,
        status: parse_enum("message.status", &status_str)?,
        provider_message_id: row.get(8).ok(),
        attachments,
        created_at: parse_datetime("message.created_at", &created_str)?,
    })
}

/// Map a libsql Row to a ScheduledMessage. Column order matches SCHEDULED_COLUMNS.
fn row_to_scheduled(row: &libsql::Row) -> Result<ScheduledMessage, DatabaseError> {
    let id_str: String = col("scheduled.id", row.get(0))?;
    let channel_str: String = col("scheduled.channel", row.get(4))?;
    let send_at_str: String = col("scheduled.send_at", row.get(5))?;
    let status_str: String = col("scheduled.status", row.get(6))?;
    let sent_at_str: Option<String> = row.get(7).ok();
    let created_str: String = col("scheduled.created_at", row.get(9))?;

    Ok(ScheduledMessage {
        id: parse_uuid("scheduled.id", &id_str)?,
        contact_id: col("scheduled.contact_id", row.get(1))?,
        user_id: col("scheduled.user_id", row.get(2))?,
        content: col("scheduled.content", row.get(3))?,
        channel: parse_enum("scheduled.channel", &channel_str)?,
        send_at: parse_datetime("scheduled.send_at", &send_at_str)?,
        status: parse_enum("scheduled.status", &status_str)?,
        sent_at: parse_optional_datetime("scheduled.sent_at", &sent_at_str)?,
        error: row.get(8).ok(),
        created_at: parse_datetime("scheduled.created_at", &created_str)?,
    })
}

fn row_to_event(row: &libsql::Row) -> Result<AnalyticsEvent, DatabaseError> {
    let conversation_str: String = col("event.conversation_id", row.get(1))?;
    let channel_str: String = col("event.channel", row.get(2))?;
    let type_str: String = col("event.event_type", row.get(3))?;
    let ts_str: String = col("event.timestamp", row.get(4))?;

    let event_type = match type_str.as_str() {
        "message_sent" => AnalyticsEventType::MessageSent,
        "message_received" => AnalyticsEventType::MessageReceived,
        other => {
            return Err(DatabaseError::Serialization(format!(
                "event.event_type: unknown {other}"
            )));
        }
    };

    Ok(AnalyticsEvent {
        contact_id: col("event.contact_id", row.get(0))?,
        conversation_id: parse_uuid("event.conversation_id", &conversation_str)?,
        channel: parse_enum("event.channel", &channel_str)?,
        event_type,
        timestamp: parse_datetime("event.timestamp", &ts_str)?,
    })
}

/// Read the first row of a result set, if any.
async fn first_row<T>(
    rows: &mut libsql::Rows,
    op: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => map(&row).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

/// Read every row of a result set, skipping rows that fail to parse.
async fn all_rows<T>(
    rows: &mut libsql::Rows,
    op: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut items = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match map(&row) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("Skipping {op} row: {e}"),
            },
            Ok(None) => return Ok(items),
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

const CONTACT_COLUMNS: &str = "id, name, phone, email, created_by_id, created_at";

const CONVERSATION_COLUMNS: &str = "id, contact_id, status, last_message_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, contact_id, user_id, content, channel, direction, status, provider_message_id, attachments, created_at";

const SCHEDULED_COLUMNS: &str =
    "id, contact_id, user_id, content, channel, send_at, status, sent_at, error, created_at";

const EVENT_COLUMNS: &str = "contact_id, conversation_id, channel, event_type, timestamp";

impl LibSqlBackend {
    async fn insert_message_row(
        &self,
        message: &Message,
        or_ignore: bool,
    ) -> Result<u64, DatabaseError> {
        let attachments = if message.attachments.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&message.attachments)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )
        };
        let verb = if or_ignore {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };

        self.conn()
            .execute(
                &format!(
                    "{verb} INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.contact_id.as_str(),
                    opt_text(message.user_id.as_deref()),
                    message.content.as_str(),
                    message.channel.as_str(),
                    message.direction.as_str(),
                    message.status.as_str(),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(attachments.as_deref()),
                    fmt_ts(message.created_at),
                ],
            )
            .await
            .map_err(|e| write_error("insert_message", e))
    }
}

#[async_trait]
impl Store for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO contacts ({CONTACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    contact.id.as_str(),
                    opt_text(contact.name.as_deref()),
                    opt_text(contact.phone.as_deref()),
                    opt_text(contact.email.as_deref()),
                    contact.created_by_id.as_str(),
                    fmt_ts(contact.created_at),
                ],
            )
            .await
            .map_err(|e| write_error("insert_contact", e))?;

        debug!(contact_id = %contact.id, "Contact inserted into DB");
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact: {e}")))?;
        first_row(&mut rows, "get_contact", row_to_contact).await
    }

    async fn find_contact_by_address(
        &self,
        address: &ContactAddress,
    ) -> Result<Option<Contact>, DatabaseError> {
        let column = match address {
            ContactAddress::Phone(_) => "phone",
            ContactAddress::Email(_) => "email",
        };
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE {column} = ?1"),
                params![address.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_contact_by_address: {e}")))?;
        first_row(&mut rows, "find_contact_by_address", row_to_contact).await
    }

    async fn insert_contact_or_get(
        &self,
        contact: &Contact,
        address: &ContactAddress,
    ) -> Result<Contact, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO contacts ({CONTACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    contact.id.as_str(),
                    opt_text(contact.name.as_deref()),
                    opt_text(contact.phone.as_deref()),
                    opt_text(contact.email.as_deref()),
                    contact.created_by_id.as_str(),
                    fmt_ts(contact.created_at),
                ],
            )
            .await
            .map_err(|e| write_error("insert_contact_or_get", e))?;

        if inserted > 0 {
            info!(contact_id = %contact.id, address = address.as_str(), "Contact created");
        }

        self.find_contact_by_address(address).await?.ok_or_else(|| {
            DatabaseError::Constraint(format!(
                "insert_contact_or_get: contact {} conflicts but no contact owns {}",
                contact.id,
                address.as_str()
            ))
        })
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;
        first_row(&mut rows, "get_conversation", row_to_conversation).await
    }

    async fn get_conversation_by_contact(
        &self,
        contact_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE contact_id = ?1"),
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation_by_contact: {e}")))?;
        first_row(&mut rows, "get_conversation_by_contact", row_to_conversation).await
    }

    async fn get_or_create_conversation(
        &self,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, DatabaseError> {
        let id = Uuid::new_v4();
        let ts = fmt_ts(now);
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO conversations (id, contact_id, status, last_message_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![
                    id.to_string(),
                    contact_id,
                    ConversationStatus::Unread.as_str(),
                    ts,
                ],
            )
            .await
            .map_err(|e| write_error("get_or_create_conversation", e))?;

        if inserted > 0 {
            debug!(conversation_id = %id, contact_id, "Conversation created");
        }

        self.get_conversation_by_contact(contact_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: contact_id.to_string(),
            })
    }

    async fn set_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE conversations SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_status: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_inbound_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let inserted = self.insert_message_row(message, true).await? > 0;
        if inserted {
            debug!(message_id = %message.id, provider_id = ?message.provider_message_id, "Inbound message inserted into DB");
        } else {
            debug!(provider_id = ?message.provider_message_id, "Duplicate inbound message ignored");
        }
        Ok(inserted)
    }

    async fn insert_outbound_message(&self, message: &Message) -> Result<(), DatabaseError> {
        self.insert_message_row(message, false).await?;
        debug!(message_id = %message.id, "Outbound message inserted into DB");
        Ok(())
    }

    async fn find_inbound_message(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider_message_id = ?1 AND direction = 'INBOUND'"
                ),
                params![provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_inbound_message: {e}")))?;
        first_row(&mut rows, "find_inbound_message", row_to_message).await
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversation_messages: {e}")))?;
        all_rows(&mut rows, "list_conversation_messages", row_to_message).await
    }

    // ── Scheduled messages ──────────────────────────────────────────

    async fn insert_scheduled(&self, message: &ScheduledMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO scheduled_messages ({SCHEDULED_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    message.id.to_string(),
                    message.contact_id.as_str(),
                    message.user_id.as_str(),
                    message.content.as_str(),
                    message.channel.as_str(),
                    fmt_ts(message.send_at),
                    message.status.as_str(),
                    opt_text(message.sent_at.map(fmt_ts).as_deref()),
                    opt_text(message.error.as_deref()),
                    fmt_ts(message.created_at),
                ],
            )
            .await
            .map_err(|e| write_error("insert_scheduled", e))?;

        debug!(scheduled_id = %message.id, send_at = %message.send_at, "Scheduled message inserted into DB");
        Ok(())
    }

    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_scheduled: {e}")))?;
        first_row(&mut rows, "get_scheduled", row_to_scheduled).await
    }

    async fn list_scheduled(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE status = ?1 ORDER BY send_at ASC"
                    ),
                    params![status.as_str()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages ORDER BY send_at ASC"
                    ),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_scheduled: {e}")))?;
        all_rows(&mut rows, "list_scheduled", row_to_scheduled).await
    }

    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages
                     WHERE status = 'PENDING' AND send_at <= ?1
                       AND (claim_token IS NULL OR claimed_at < ?2)
                     ORDER BY send_at ASC, created_at ASC
                     LIMIT ?3"
                ),
                params![fmt_ts(now), fmt_ts(lease_cutoff), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_scheduled: {e}")))?;
        all_rows(&mut rows, "list_due_scheduled", row_to_scheduled).await
    }

    async fn claim_scheduled(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<Claim>, DatabaseError> {
        let token = Uuid::new_v4();
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET claim_token = ?1, claimed_at = ?2
                 WHERE id = ?3 AND status = 'PENDING'
                   AND (claim_token IS NULL OR claimed_at < ?4)",
                params![
                    token.to_string(),
                    fmt_ts(now),
                    id.to_string(),
                    fmt_ts(lease_cutoff),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_scheduled: {e}")))?;

        if count == 0 {
            debug!(scheduled_id = %id, "Claim lost");
            return Ok(None);
        }
        Ok(Some(Claim {
            id,
            token,
            claimed_at: now,
        }))
    }

    async fn mark_scheduled_sent(
        &self,
        claim: &Claim,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages
                 SET status = 'SENT', sent_at = ?1, error = NULL, claim_token = NULL, claimed_at = NULL
                 WHERE id = ?2 AND status = 'PENDING' AND claim_token = ?3",
                params![fmt_ts(sent_at), claim.id.to_string(), claim.token.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scheduled_sent: {e}")))?;
        Ok(count > 0)
    }

    async fn mark_scheduled_failed(
        &self,
        claim: &Claim,
        error: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages
                 SET status = 'FAILED', error = ?1, claim_token = NULL, claimed_at = NULL
                 WHERE id = ?2 AND status = 'PENDING' AND claim_token = ?3",
                params![error, claim.id.to_string(), claim.token.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_scheduled_failed: {e}")))?;
        Ok(count > 0)
    }

    async fn release_claim(&self, claim: &Claim) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET claim_token = NULL, claimed_at = NULL
                 WHERE id = ?1 AND status = 'PENDING' AND claim_token = ?2",
                params![claim.id.to_string(), claim.token.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        Ok(count > 0)
    }

    async fn cancel_scheduled(
        &self,
        id: Uuid,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<CancelOutcome, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET status = 'CANCELLED'
                 WHERE id = ?1 AND status = 'PENDING'
                   AND (claim_token IS NULL OR claimed_at < ?2)",
                params![id.to_string(), fmt_ts(lease_cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_scheduled: {e}")))?;

        if count > 0 {
            info!(scheduled_id = %id, "Scheduled message cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        Ok(match self.get_scheduled(id).await? {
            None => CancelOutcome::NotFound,
            Some(item) if item.status.is_terminal() => CancelOutcome::NotPending(item.status),
            Some(_) => CancelOutcome::Claimed,
        })
    }

    // ── Analytics ───────────────────────────────────────────────────

    async fn record_event(&self, event: &AnalyticsEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO analytics_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    event.contact_id.as_str(),
                    event.conversation_id.to_string(),
                    event.channel.as_str(),
                    event.event_type.as_str(),
                    fmt_ts(event.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_event: {e}")))?;
        Ok(())
    }

    async fn list_events_for_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<AnalyticsEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM analytics_events WHERE contact_id = ?1 ORDER BY id ASC"
                ),
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events_for_contact: {e}")))?;
        all_rows(&mut rows, "list_events_for_contact", row_to_event).await
    }
}
