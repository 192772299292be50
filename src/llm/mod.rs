//! LLM integration.
//!
//! The engine talks to the text-generation capability through the
//! `LlmProvider` trait; the shipped implementation is an
//! OpenAI-compatible chat-completions client.

pub mod openai;
pub mod provider;

pub use openai::{OpenAiConfig, OpenAiProvider};
pub use provider::*;
