//! SMS lead re-engagement engine.
//!
//! Paces outbound messages to dormant leads, ingests webhook replies,
//! classifies intent, and drives each conversation to a booked call or
//! a permanent opt-out. The conversation state machine in [`machine`]
//! is the authoritative lifecycle; everything else feeds it events and
//! acts on its effects.

pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod machine;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod transport;
pub mod worker;

pub use engine::Engine;
pub use error::{Error, Result};
