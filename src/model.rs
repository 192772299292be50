//! Domain types: leads, conversations, messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a conversation.
///
/// `Booked` and `OptedOut` are terminal: once entered, the state machine
/// rejects every further transition for that conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    New,
    Engaged,
    Booked,
    OptedOut,
    Unresponsive,
}

impl ConversationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Booked | Self::OptedOut)
    }

    /// DB string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Engaged => "engaged",
            Self::Booked => "booked",
            Self::OptedOut => "opted_out",
            Self::Unresponsive => "unresponsive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "engaged" => Some(Self::Engaged),
            "booked" => Some(Self::Booked),
            "opted_out" => Some(Self::OptedOut),
            "unresponsive" => Some(Self::Unresponsive),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prospective contact imported from an external source.
///
/// Leads are created by the (out-of-scope) import layer and never
/// deleted; the engine holds them by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub name: String,
    pub phone_number: String,
    pub email: Option<String>,
    /// Free-form attributes carried along from import (industry, notes…).
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The lifecycle instance governing one lead's SMS exchange.
///
/// At most one non-terminal conversation exists per lead at a time
/// (enforced by the store). Mutated exclusively through the state
/// machine's atomic transition operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub state: ConversationState,
    pub last_contact: Option<DateTime<Utc>>,
    pub booking_link_sent: bool,
    pub booking_completed: bool,
    /// Outstanding scheduled-reply flag: an inbound message asked for a
    /// reply that the next sweep should send.
    pub reply_due: bool,
    pub reengagement_attempts: u32,
    /// Sends that exhausted their transport retries. A counter, not a
    /// state change; the conversation stays due.
    pub delivery_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message direction relative to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Delivery status of an outbound message. Inbound messages are always
/// `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One entry in a conversation's append-only message log.
///
/// Immutable once persisted (delivery status/error excepted). The
/// ordered sequence of messages is the context given to the composer
/// and classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub delivery_error: Option<String>,
    /// Transport-assigned identifier; set for inbound messages and used
    /// as the webhook dedup key. Unique across the system.
    pub transport_id: Option<String>,
}
