//! Outbound message composition.
//!
//! Builds an LLM prompt from the lead profile, conversation history
//! and trigger, and falls back to deterministic templates when the
//! provider fails. Composition never returns an empty body. Output is
//! truncated to the configured length on a char boundary.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::model::{Direction, Lead, Message};

/// Why a message is being composed. Drives both the prompt framing and
/// the fallback template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeTrigger {
    /// First contact with a lead that has never been messaged.
    InitialOutreach,
    /// Answering an inbound message.
    Reply,
    /// Nudging a lead that went quiet.
    Reengagement,
}

/// A composed outbound body plus whether it carries the booking link.
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub body: String,
    pub contains_booking_link: bool,
}

pub struct Composer {
    llm: Option<Arc<dyn LlmProvider>>,
    booking_link: String,
    max_body_chars: usize,
}

impl Composer {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, config: &EngineConfig) -> Self {
        Self {
            llm,
            booking_link: config.booking_link.clone(),
            max_body_chars: config.max_body_chars,
        }
    }

    /// Compose an outbound body for `lead`. LLM first, template on any
    /// failure; the result is never empty.
    pub async fn compose(
        &self,
        lead: &Lead,
        history: &[Message],
        trigger: ComposeTrigger,
    ) -> ComposedMessage {
        let body = match &self.llm {
            Some(llm) => match self.compose_with_llm(llm.as_ref(), lead, history, trigger).await {
                Some(body) => body,
                None => {
                    warn!(lead_id = %lead.id, "LLM composition failed, using template fallback");
                    self.fallback(lead, trigger)
                }
            },
            None => self.fallback(lead, trigger),
        };

        let body = truncate_chars(&body, self.max_body_chars);
        let contains_booking_link = body.contains(&self.booking_link);
        ComposedMessage {
            body,
            contains_booking_link,
        }
    }

    async fn compose_with_llm(
        &self,
        llm: &dyn LlmProvider,
        lead: &Lead,
        history: &[Message],
        trigger: ComposeTrigger,
    ) -> Option<String> {
        let mut messages = vec![ChatMessage::system(self.system_prompt(lead))];
        for message in history {
            match message.direction {
                Direction::Inbound => messages.push(ChatMessage::user(&message.body)),
                Direction::Outbound => messages.push(ChatMessage::assistant(&message.body)),
            }
        }
        messages.push(ChatMessage::user(trigger_instruction(trigger)));

        let request = CompletionRequest::new(messages)
            .with_temperature(0.7)
            .with_max_tokens(150);

        match llm.complete(request).await {
            Ok(response) => {
                let body = response.content.trim().to_string();
                if body.is_empty() {
                    None
                } else {
                    debug!(lead_id = %lead.id, chars = body.len(), "LLM composed message");
                    Some(body)
                }
            }
            Err(e) => {
                warn!(lead_id = %lead.id, "LLM compose request failed: {e}");
                None
            }
        }
    }

    fn system_prompt(&self, lead: &Lead) -> String {
        let mut prompt = format!(
            "You are a friendly sales assistant re-engaging leads over SMS. \
             Keep replies short, warm and conversational. Never sound like a bot. \
             Your goal is to get the lead to book a call using this link: {}.\n\n\
             Lead name: {}\nLead phone: {}",
            self.booking_link, lead.name, lead.phone_number
        );
        if let Some(email) = &lead.email {
            prompt.push_str(&format!("\nLead email: {email}"));
        }
        if !lead.attributes.is_null() {
            prompt.push_str(&format!("\nLead details: {}", lead.attributes));
        }
        prompt.push_str(
            "\n\nIf the lead shows interest, share the booking link. \
             If they ask a question, answer it briefly and steer back to booking. \
             Never promise anything you cannot verify.",
        );
        prompt
    }

    fn fallback(&self, lead: &Lead, trigger: ComposeTrigger) -> String {
        let first_name = lead.name.split_whitespace().next().unwrap_or(&lead.name);
        match trigger {
            ComposeTrigger::InitialOutreach => format!(
                "Hi {first_name}! Following up on your interest. Would you like to grab a \
                 time that works for you? {}",
                self.booking_link
            ),
            ComposeTrigger::Reply => format!(
                "Thanks for getting back to us, {first_name}! The easiest next step is to \
                 pick a time here: {}",
                self.booking_link
            ),
            ComposeTrigger::Reengagement => format!(
                "Hi {first_name}, just checking in. Still happy to find a time whenever \
                 suits you: {}",
                self.booking_link
            ),
        }
    }
}

fn trigger_instruction(trigger: ComposeTrigger) -> &'static str {
    match trigger {
        ComposeTrigger::InitialOutreach => {
            "Write the first outreach message to this lead. Introduce yourself briefly \
             and invite them to book a call."
        }
        ComposeTrigger::Reply => {
            "Write a reply to the lead's last message above. Address what they said."
        }
        ComposeTrigger::Reengagement => {
            "The lead has gone quiet. Write a short, low-pressure check-in message."
        }
    }
}

/// Truncate to at most `max` chars, cutting on a char boundary. Byte
/// slicing would panic mid-codepoint.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
