//! Inbound message intent classification.
//!
//! Two tiers: an ordered rule pass over lowercased text, then an LLM
//! fallback for anything the rules do not catch. Opt-out rules run
//! first and always win. A failed or unparseable LLM call degrades to
//! `Intent::Generic` so classification can never block the pipeline.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, ChatMessage, LlmProvider};
use crate::machine::Intent;

/// A single classification rule. Rules are evaluated in order and the
/// first match wins.
struct Rule {
    name: &'static str,
    pattern: Regex,
    intent: Intent,
}

pub struct IntentClassifier {
    rules: Vec<Rule>,
    llm: Option<Arc<dyn LlmProvider>>,
}

impl IntentClassifier {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            rules: build_rules(),
            llm,
        }
    }

    /// Classify an inbound body. Rule pass first; opt-out is checked
    /// before anything else and pre-empts all other intents.
    pub async fn classify(&self, body: &str) -> Intent {
        let text = body.trim().to_lowercase();

        for rule in &self.rules {
            if rule.pattern.is_match(&text) {
                debug!(rule = rule.name, intent = ?rule.intent, "Rule matched inbound message");
                return rule.intent;
            }
        }

        if let Some(llm) = &self.llm {
            match self.classify_with_llm(llm.as_ref(), body).await {
                Some(intent) => return intent,
                None => {
                    warn!("LLM classification failed, defaulting to generic intent");
                }
            }
        }

        Intent::Generic
    }

    async fn classify_with_llm(&self, llm: &dyn LlmProvider, body: &str) -> Option<Intent> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(
                "You classify SMS replies from sales leads. Respond with exactly one word \
                 from this list: opt_out, booking_confirmed, question, generic. \
                 opt_out means the lead wants no further messages. booking_confirmed means \
                 the lead says they already booked or scheduled an appointment. question \
                 means the lead is asking something. Anything else is generic.",
            ),
            ChatMessage::user(body),
        ])
        .with_temperature(0.0)
        .with_max_tokens(4);

        let response = match llm.complete(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!("LLM classify request failed: {e}");
                return None;
            }
        };

        let label = response.content.trim().trim_matches('"').to_lowercase();
        let intent = match label.as_str() {
            "opt_out" => Intent::OptOut,
            "booking_confirmed" => Intent::BookingConfirmed,
            "question" => Intent::Question,
            "generic" => Intent::Generic,
            other => {
                warn!(label = other, "LLM returned unknown intent label");
                return None;
            }
        };
        debug!(intent = ?intent, "LLM classified inbound message");
        Some(intent)
    }
}

fn build_rules() -> Vec<Rule> {
    // Order matters: opt-out pre-empts everything else.
    vec![
        Rule {
            name: "opt_out_keywords",
            pattern: Regex::new(
                r"\b(stop|unsubscribe|opt\s*out|remove\s+me)\b|don'?t\s+(text|message|contact)",
            )
            .unwrap(),
            intent: Intent::OptOut,
        },
        Rule {
            name: "booking_keywords",
            pattern: Regex::new(
                r"\b(booked|scheduled|appointment|meeting)\b|call\s+scheduled|i'?m\s+all\s+set",
            )
            .unwrap(),
            intent: Intent::BookingConfirmed,
        },
        Rule {
            name: "question_mark",
            pattern: Regex::new(r"\?").unwrap(),
            intent: Intent::Question,
        },
    ]
}
