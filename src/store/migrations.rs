//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//!
//! The schema carries the gateway's cross-invocation invariants: one contact
//! per phone/email, one conversation per contact, one inbound message per
//! provider id, and an insert trigger that bumps the owning conversation in
//! the same statement as the message write.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "inbox_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                name TEXT,
                phone TEXT UNIQUE,
                email TEXT UNIQUE,
                created_by_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL UNIQUE REFERENCES contacts(id),
                status TEXT NOT NULL DEFAULT 'UNREAD',
                last_message_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_last_message
                ON conversations(last_message_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                user_id TEXT,
                content TEXT NOT NULL,
                channel TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                attachments TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_inbound_provider_id
                ON messages(provider_message_id) WHERE direction = 'INBOUND';

            CREATE TRIGGER IF NOT EXISTS trg_messages_bump_conversation
            AFTER INSERT ON messages
            BEGIN
                UPDATE conversations
                SET last_message_at = max(last_message_at, NEW.created_at),
                    status = CASE WHEN NEW.direction = 'INBOUND' THEN 'UNREAD' ELSE status END
                WHERE id = NEW.conversation_id;
            END;
        "#,
    },
    Migration {
        version: 2,
        name: "scheduled_messages",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id),
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                channel TEXT NOT NULL,
                send_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                sent_at TEXT,
                error TEXT,
                claim_token TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_due
                ON scheduled_messages(status, send_at);
        "#,
    },
    Migration {
        version: 3,
        name: "analytics_events",
        sql: r#"
            CREATE TABLE IF NOT EXISTS analytics_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_analytics_contact
                ON analytics_events(contact_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count_objects(conn: &Connection, kind: &str, name: &str) -> i64 {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
                libsql::params![kind, name],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "contacts",
            "conversations",
            "messages",
            "scheduled_messages",
            "analytics_events",
            "_migrations",
        ] {
            assert_eq!(
                count_objects(&conn, "table", table).await,
                1,
                "Table '{}' should exist",
                table
            );
        }
        assert_eq!(
            count_objects(&conn, "trigger", "trg_messages_bump_conversation").await,
            1
        );
        assert_eq!(
            count_objects(&conn, "index", "idx_messages_inbound_provider_id").await,
            1
        );
    }

    #[test]
    fn migration_future_is_send() {
        fn assert_send<F: std::future::Future + Send>(_: F) {}
        let _ = |conn: &'static Connection| assert_send(run_migrations(conn));
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            seen.push((v, n));
        }
        assert_eq!(
            seen,
            vec![
                (1, "inbox_schema".to_string()),
                (2, "scheduled_messages".to_string()),
                (3, "analytics_events".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn inbound_provider_id_is_unique_but_outbound_is_not() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute_batch(
            "INSERT INTO contacts (id, created_by_id, created_at) VALUES ('c1', 'u1', '2026-01-01T00:00:00.000000Z');
             INSERT INTO conversations (id, contact_id, last_message_at, created_at)
                VALUES ('v1', 'c1', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z');
             INSERT INTO messages (id, conversation_id, contact_id, content, channel, direction, status, provider_message_id, created_at)
                VALUES ('m1', 'v1', 'c1', 'a', 'SMS', 'OUTBOUND', 'SENT', 'SM1', '2026-01-01T00:00:01.000000Z');
             INSERT INTO messages (id, conversation_id, contact_id, content, channel, direction, status, provider_message_id, created_at)
                VALUES ('m2', 'v1', 'c1', 'b', 'SMS', 'OUTBOUND', 'SENT', 'SM1', '2026-01-01T00:00:02.000000Z');
             INSERT INTO messages (id, conversation_id, contact_id, content, channel, direction, status, provider_message_id, created_at)
                VALUES ('m3', 'v1', 'c1', 'c', 'SMS', 'INBOUND', 'DELIVERED', 'SM2', '2026-01-01T00:00:03.000000Z');",
        )
        .await
        .unwrap();

        let dup = conn
            .execute(
                "INSERT INTO messages (id, conversation_id, contact_id, content, channel, direction, status, provider_message_id, created_at)
                 VALUES ('m4', 'v1', 'c1', 'd', 'SMS', 'INBOUND', 'DELIVERED', 'SM2', '2026-01-01T00:00:04.000000Z')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
