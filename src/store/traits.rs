//! Async persistence interface for leads, conversations, and messages.
//!
//! All conversation state mutation goes through `transition_state`, an
//! atomic compare-and-swap: the write only lands if the conversation is
//! still in the expected state, which closes the race between the
//! scheduler and the inbound pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Conversation, ConversationState, DeliveryStatus, Direction, Lead, Message};

/// Filter for conversation listings.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub state: Option<ConversationState>,
    pub lead_id: Option<Uuid>,
}

/// A new outbound or inbound message to persist.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub body: &'a str,
    pub sent_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub delivery_error: Option<&'a str>,
    pub transport_id: Option<&'a str>,
}

/// Persistence capability.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a lead (import layer and tests).
    async fn insert_lead(&self, lead: &Lead) -> Result<(), StoreError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError>;

    async fn get_lead_by_phone(&self, phone_number: &str) -> Result<Option<Lead>, StoreError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Create a conversation for a lead in the given initial state.
    ///
    /// Fails with `Constraint` if the lead already has a non-terminal
    /// conversation.
    async fn create_conversation(
        &self,
        lead_id: Uuid,
        state: ConversationState,
        now: DateTime<Utc>,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// The lead's single non-terminal conversation, if any.
    async fn active_conversation_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;

    /// All non-terminal conversations (scheduler sweep input).
    async fn list_active_conversations(&self) -> Result<Vec<Conversation>, StoreError>;

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Atomic check-state-and-transition. Returns `true` if the write
    /// landed, `false` if the conversation was no longer in `from`.
    async fn transition_state(
        &self,
        id: Uuid,
        from: ConversationState,
        to: ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record an outbound contact: set `last_contact`, clear `reply_due`.
    async fn record_outbound_contact(&self, id: Uuid, at: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Record an inbound contact: set `last_contact`.
    async fn record_inbound_contact(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn set_reply_due(&self, id: Uuid, due: bool) -> Result<(), StoreError>;

    async fn set_booking_link_sent(&self, id: Uuid) -> Result<(), StoreError>;

    async fn set_booking_completed(&self, id: Uuid) -> Result<(), StoreError>;

    async fn increment_reengagement_attempts(&self, id: Uuid) -> Result<(), StoreError>;

    async fn increment_delivery_failures(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message to a conversation's log.
    async fn insert_message(&self, message: NewMessage<'_>) -> Result<Message, StoreError>;

    /// Ordered (oldest first) message log for a conversation.
    async fn messages_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError>;

    /// Dedup lookup by transport-assigned identifier.
    async fn get_message_by_transport_id(
        &self,
        transport_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    // ── Audit ───────────────────────────────────────────────────────

    /// Record an inbound event whose sender matches no known lead.
    async fn record_unmatched_inbound(
        &self,
        from: &str,
        body: &str,
        transport_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
