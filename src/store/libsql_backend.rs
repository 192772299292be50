//! libSQL implementation of the `Store` trait.
//!
//! Supports local file and in-memory databases. The conversation state
//! CAS is a single `UPDATE … WHERE id = ? AND state = ?`; the partial
//! unique index created by the migrations enforces the one-active-
//! conversation-per-lead invariant at the schema level.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Conversation, ConversationState, DeliveryStatus, Direction, Lead, Message};
use crate::store::migrations;
use crate::store::traits::{ConversationFilter, NewMessage, Store};

/// libSQL store backend.
///
/// Holds a single connection reused for all operations;
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async
/// use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::init_schema(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::init_schema(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const LEAD_COLUMNS: &str = "id, name, phone_number, email, attributes, created_at, updated_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, libsql::Error> {
    let id: String = row.get(0)?;
    let attributes: String = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;

    Ok(Lead {
        id: parse_uuid(&id),
        name: row.get(1)?,
        phone_number: row.get(2)?,
        email: row.get::<String>(3).ok(),
        attributes: serde_json::from_str(&attributes).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const CONVERSATION_COLUMNS: &str = "id, lead_id, state, last_contact, booking_link_sent, \
     booking_completed, reply_due, reengagement_attempts, delivery_failures, created_at, updated_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let id: String = row.get(0)?;
    let lead_id: String = row.get(1)?;
    let state: String = row.get(2)?;
    let last_contact: Option<String> = row.get::<String>(3).ok();
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;

    Ok(Conversation {
        id: parse_uuid(&id),
        lead_id: parse_uuid(&lead_id),
        state: ConversationState::parse(&state).unwrap_or(ConversationState::New),
        last_contact: last_contact.as_deref().map(parse_datetime),
        booking_link_sent: row.get::<i64>(4)? != 0,
        booking_completed: row.get::<i64>(5)? != 0,
        reply_due: row.get::<i64>(6)? != 0,
        reengagement_attempts: row.get::<i64>(7)? as u32,
        delivery_failures: row.get::<i64>(8)? as u32,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, direction, body, sent_at, delivery_status, delivery_error, transport_id";

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let direction: String = row.get(2)?;
    let sent_at: String = row.get(4)?;
    let status: String = row.get(5)?;

    Ok(Message {
        id: parse_uuid(&id),
        conversation_id: parse_uuid(&conversation_id),
        direction: Direction::parse(&direction).unwrap_or(Direction::Outbound),
        body: row.get(3)?,
        sent_at: parse_datetime(&sent_at),
        delivery_status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Queued),
        delivery_error: row.get::<String>(6).ok(),
        transport_id: row.get::<String>(7).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn insert_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let attributes = serde_json::to_string(&lead.attributes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO leads (id, name, phone_number, email, attributes, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    lead.id.to_string(),
                    lead.name.clone(),
                    lead.phone_number.clone(),
                    opt_text(lead.email.as_deref()),
                    attributes,
                    lead.created_at.to_rfc3339(),
                    lead.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_lead: {e}")))?;

        debug!(lead_id = %lead.id, "Lead inserted");
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_lead(&row).map_err(|e| StoreError::Query(format!("get_lead row: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn get_lead_by_phone(&self, phone_number: &str) -> Result<Option<Lead>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE phone_number = ?1"),
                params![phone_number],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_lead_by_phone: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row).map_err(|e| {
                StoreError::Query(format!("get_lead_by_phone row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_lead_by_phone: {e}"))),
        }
    }

    async fn create_conversation(
        &self,
        lead_id: Uuid,
        state: ConversationState,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError> {
        let id = Uuid::new_v4();
        let result = self
            .conn()
            .execute(
                "INSERT INTO conversations (id, lead_id, state, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    lead_id.to_string(),
                    state.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .await;

        if let Err(e) = result {
            let text = e.to_string();
            // The partial unique index fires when the lead already has a
            // non-terminal conversation.
            if text.contains("UNIQUE") {
                return Err(StoreError::Constraint(format!(
                    "lead {lead_id} already has an active conversation"
                )));
            }
            return Err(StoreError::Query(format!("create_conversation: {text}")));
        }

        debug!(conversation_id = %id, lead_id = %lead_id, state = %state, "Conversation created");
        Ok(Conversation {
            id,
            lead_id,
            state,
            last_contact: None,
            booking_link_sent: false,
            booking_completed: false,
            reply_due: false,
            reengagement_attempts: 0,
            delivery_failures: 0,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row).map_err(|e| {
                StoreError::Query(format!("get_conversation row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn active_conversation_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                     WHERE lead_id = ?1 AND state NOT IN ('booked', 'opted_out')"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("active_conversation_for_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row).map_err(|e| {
                StoreError::Query(format!("active_conversation_for_lead row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!(
                "active_conversation_for_lead: {e}"
            ))),
        }
    }

    async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                     WHERE state NOT IN ('booked', 'opted_out') ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_active_conversations: {e}")))?;

        let mut conversations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_conversation(&row) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => tracing::warn!("Skipping conversation row: {e}"),
            }
        }
        Ok(conversations)
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, StoreError> {
        let result = match (filter.state, filter.lead_id) {
            (Some(state), Some(lead_id)) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                             WHERE state = ?1 AND lead_id = ?2 ORDER BY updated_at DESC"
                        ),
                        params![state.as_str(), lead_id.to_string()],
                    )
                    .await
            }
            (Some(state), None) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                             WHERE state = ?1 ORDER BY updated_at DESC"
                        ),
                        params![state.as_str()],
                    )
                    .await
            }
            (None, Some(lead_id)) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                             WHERE lead_id = ?1 ORDER BY updated_at DESC"
                        ),
                        params![lead_id.to_string()],
                    )
                    .await
            }
            (None, None) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                             ORDER BY updated_at DESC"
                        ),
                        (),
                    )
                    .await
            }
        };
        let mut rows = result.map_err(|e| StoreError::Query(format!("list_conversations: {e}")))?;

        let mut conversations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_conversation(&row) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => tracing::warn!("Skipping conversation row: {e}"),
            }
        }
        Ok(conversations)
    }

    async fn transition_state(
        &self,
        id: Uuid,
        from: ConversationState,
        to: ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE conversations SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![
                    to.as_str(),
                    now.to_rfc3339(),
                    id.to_string(),
                    from.as_str(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transition_state: {e}")))?;

        if changed > 0 {
            debug!(conversation_id = %id, from = %from, to = %to, "State transition applied");
        }
        Ok(changed > 0)
    }

    async fn record_outbound_contact(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET last_contact = ?1, reply_due = 0, updated_at = ?1 \
                 WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_outbound_contact: {e}")))?;
        Ok(())
    }

    async fn record_inbound_contact(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET last_contact = ?1, updated_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_inbound_contact: {e}")))?;
        Ok(())
    }

    async fn set_reply_due(&self, id: Uuid, due: bool) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET reply_due = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    due as i64,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_reply_due: {e}")))?;
        Ok(())
    }

    async fn set_booking_link_sent(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET booking_link_sent = 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_booking_link_sent: {e}")))?;
        Ok(())
    }

    async fn set_booking_completed(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET booking_completed = 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_booking_completed: {e}")))?;
        Ok(())
    }

    async fn increment_reengagement_attempts(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET reengagement_attempts = reengagement_attempts + 1, \
                 updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("increment_reengagement_attempts: {e}")))?;
        Ok(())
    }

    async fn increment_delivery_failures(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET delivery_failures = delivery_failures + 1, \
                 updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("increment_delivery_failures: {e}")))?;
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage<'_>) -> Result<Message, StoreError> {
        let id = Uuid::new_v4();
        let result = self
            .conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, direction, body, sent_at, \
                 delivery_status, delivery_error, transport_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    message.conversation_id.to_string(),
                    message.direction.as_str(),
                    message.body,
                    message.sent_at.to_rfc3339(),
                    message.delivery_status.as_str(),
                    opt_text(message.delivery_error),
                    opt_text(message.transport_id),
                ],
            )
            .await;

        if let Err(e) = result {
            let text = e.to_string();
            if text.contains("UNIQUE") {
                return Err(StoreError::Constraint(format!(
                    "transport id already recorded: {:?}",
                    message.transport_id
                )));
            }
            return Err(StoreError::Query(format!("insert_message: {text}")));
        }

        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            direction: message.direction,
            body: message.body.to_string(),
            sent_at: message.sent_at,
            delivery_status: message.delivery_status,
            delivery_error: message.delivery_error.map(String::from),
            transport_id: message.transport_id.map(String::from),
        })
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = ?1 ORDER BY sent_at ASC, id ASC"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("messages_for_conversation: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn get_message_by_transport_id(
        &self,
        transport_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE transport_id = ?1"),
                params![transport_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_message_by_transport_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row).map_err(|e| {
                StoreError::Query(format!("get_message_by_transport_id row: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!(
                "get_message_by_transport_id: {e}"
            ))),
        }
    }

    async fn record_unmatched_inbound(
        &self,
        from: &str,
        body: &str,
        transport_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO unmatched_inbound (id, from_number, body, transport_id, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    from,
                    body,
                    transport_id,
                    received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_unmatched_inbound: {e}")))?;

        debug!(from = %from, transport_id = %transport_id, "Unmatched inbound recorded");
        Ok(())
    }
}
