//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL; `init_schema` applies
//! the ones newer than the recorded version, sequentially.

use libsql::Connection;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone_number TEXT NOT NULL UNIQUE,
            email TEXT,
            attributes TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_leads_phone ON leads(phone_number);

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL REFERENCES leads(id),
            state TEXT NOT NULL DEFAULT 'new',
            last_contact TEXT,
            booking_link_sent INTEGER NOT NULL DEFAULT 0,
            booking_completed INTEGER NOT NULL DEFAULT 0,
            reply_due INTEGER NOT NULL DEFAULT 0,
            reengagement_attempts INTEGER NOT NULL DEFAULT 0,
            delivery_failures INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_state ON conversations(state);
        -- One non-terminal conversation per lead, enforced in the schema.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_lead
            ON conversations(lead_id)
            WHERE state NOT IN ('booked', 'opted_out');

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            direction TEXT NOT NULL,
            body TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            delivery_status TEXT NOT NULL,
            delivery_error TEXT,
            transport_id TEXT UNIQUE
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, sent_at);

        CREATE TABLE IF NOT EXISTS unmatched_inbound (
            id TEXT PRIMARY KEY,
            from_number TEXT NOT NULL,
            body TEXT NOT NULL,
            transport_id TEXT,
            received_at TEXT NOT NULL
        );
    "#,
}];

/// Apply pending migrations.
pub async fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL)",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {e}", migration.name)))?;

        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("record {}: {e}", migration.name)))?;

        tracing::info!(version = migration.version, name = migration.name, "Migration applied");
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Migration(format!("read version: {e}"))),
    }
}
