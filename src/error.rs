//! Error types for the re-engagement engine.

use std::time::Duration;

use uuid::Uuid;

use crate::model::ConversationState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Lead {0} not found")]
    LeadNotFound(Uuid),

    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("An outbound send is already in flight for lead {0}")]
    SlotBusy(Uuid),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// SMS transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send to {to} rejected: {reason}")]
    SendRejected { to: String, reason: String },

    #[error("Transport request failed: {0}")]
    Request(String),

    #[error("Transport rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} returned empty content")]
    EmptyResponse { provider: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// State machine rejections.
///
/// These are explicit, observable errors: a caller attempting an illegal
/// transition must see the rejection, not a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("conversation is in terminal state {state}, no further transitions accepted")]
    Terminal { state: ConversationState },

    #[error("no transition from state {state} on event {event}")]
    Undefined { state: ConversationState, event: String },
}

/// Inbound pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Conflicting concurrent transitions for conversation {0}")]
    TransitionRace(Uuid),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
