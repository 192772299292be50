//! Shared outbound send path.
//!
//! Every outbound message, whether the scheduler, the inbound pipeline
//! or a manual API call initiates it, goes through `OutboundSender`.
//! The caller must hold the lead's execution slot; this module re-reads
//! the conversation and re-validates the transition immediately before
//! touching the transport, so a state change that raced the caller's
//! decision to send is caught here.

use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Error, Result, TransportError};
use crate::machine::{self, Event};
use crate::model::{Conversation, DeliveryStatus, Direction, Lead, Message};
use crate::pipeline::composer::{ComposeTrigger, Composer};
use crate::store::{NewMessage, Store};
use crate::transport::{DeliveryReceipt, SmsTransport};

pub struct OutboundSender {
    store: Arc<dyn Store>,
    transport: Arc<dyn SmsTransport>,
    composer: Composer,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl OutboundSender {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn SmsTransport>,
        composer: Composer,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            composer,
            clock,
            config,
        }
    }

    /// Compose a message for the conversation's lead and send it.
    pub async fn compose_and_send(
        &self,
        conversation_id: uuid::Uuid,
        trigger: ComposeTrigger,
    ) -> Result<Message> {
        let (conversation, lead) = self.load_and_validate(conversation_id).await?;
        let history = self.store.messages_for_conversation(conversation.id).await?;
        let composed = self.composer.compose(&lead, &history, trigger).await;
        self.deliver(conversation.id, &lead, &composed.body, composed.contains_booking_link)
            .await
    }

    /// Send an operator-supplied body as-is.
    pub async fn send_raw(&self, conversation_id: uuid::Uuid, body: &str) -> Result<Message> {
        let (conversation, lead) = self.load_and_validate(conversation_id).await?;
        let contains_link = body.contains(&self.config.booking_link);
        self.deliver(conversation.id, &lead, body, contains_link).await
    }

    /// Check that an outbound send is legal before any composition work
    /// is spent. `deliver` re-checks right before the transport call.
    async fn load_and_validate(
        &self,
        conversation_id: uuid::Uuid,
    ) -> Result<(Conversation, Lead)> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))?;

        machine::apply(conversation.state, Event::OutboundSent)?;

        let lead = self
            .store
            .get_lead(conversation.lead_id)
            .await?
            .ok_or(Error::LeadNotFound(conversation.lead_id))?;

        Ok((conversation, lead))
    }

    async fn deliver(
        &self,
        conversation_id: uuid::Uuid,
        lead: &Lead,
        body: &str,
        contains_booking_link: bool,
    ) -> Result<Message> {
        // Composition suspends on the LLM, which is time enough for an
        // opt-out webhook to land. The slot does not cover that writer,
        // so the state is re-read with the transport call imminent.
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))?;
        machine::apply(conversation.state, Event::OutboundSent)?;

        let receipt = match self.send_with_retry(&lead.phone_number, body).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let now = self.clock.now();
                self.store
                    .insert_message(NewMessage {
                        conversation_id: conversation.id,
                        direction: Direction::Outbound,
                        body,
                        sent_at: now,
                        delivery_status: DeliveryStatus::Failed,
                        delivery_error: Some(&e.to_string()),
                        transport_id: None,
                    })
                    .await?;
                self.store.increment_delivery_failures(conversation.id).await?;
                warn!(
                    conversation_id = %conversation.id,
                    lead_id = %lead.id,
                    "Outbound delivery failed: {e}"
                );
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let message = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                direction: Direction::Outbound,
                body,
                sent_at: now,
                delivery_status: DeliveryStatus::Delivered,
                delivery_error: None,
                transport_id: receipt.transport_id.as_deref(),
            })
            .await?;

        let transition = machine::apply(conversation.state, Event::OutboundSent)?;
        let applied = self
            .store
            .transition_state(conversation.id, conversation.state, transition.next, now)
            .await?;
        if !applied {
            // The send already happened; the racing writer owns the
            // state now, so only the bookkeeping below proceeds.
            warn!(
                conversation_id = %conversation.id,
                expected = %conversation.state,
                "State moved during send, transition skipped"
            );
        }

        self.store.record_outbound_contact(conversation.id, now).await?;
        if contains_booking_link && !conversation.booking_link_sent {
            self.store.set_booking_link_sent(conversation.id).await?;
        }

        info!(
            conversation_id = %conversation.id,
            lead_id = %lead.id,
            chars = body.chars().count(),
            booking_link = contains_booking_link,
            "Outbound message sent"
        );
        Ok(message)
    }

    /// Transport send with exponential backoff. Attempts are capped by
    /// `max_send_attempts`; each retry waits base * 2^n plus a random
    /// jitter so synchronized retries from several leads spread out.
    async fn send_with_retry(
        &self,
        to: &str,
        body: &str,
    ) -> std::result::Result<DeliveryReceipt, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send(to, body).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_send_attempts {
                        return Err(e);
                    }
                    let base = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                    let delay = base + std::time::Duration::from_millis(jitter_ms);
                    warn!(attempt, ?delay, "Transport send failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    use crate::clock::ManualClock;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::model::ConversationState;
    use crate::store::LibSqlStore;

    struct ScriptedTransport {
        // Errors to return before the first success.
        failures: Mutex<u32>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn failing_times(n: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(n),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SmsTransport for ScriptedTransport {
        async fn send(
            &self,
            _to: &str,
            body: &str,
        ) -> std::result::Result<DeliveryReceipt, TransportError> {
            self.calls.lock().unwrap().push(body.to_string());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Request("carrier timeout".into()));
            }
            Ok(DeliveryReceipt {
                transport_id: Some(format!("SM{}", self.calls.lock().unwrap().len())),
            })
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_base_delay: Duration::from_millis(1),
            max_send_attempts: 3,
            ..EngineConfig::default()
        }
    }

    async fn setup(
        transport: Arc<ScriptedTransport>,
        state: ConversationState,
    ) -> (OutboundSender, Arc<LibSqlStore>, Uuid) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let now = Utc::now();
        let lead = Lead {
            id: Uuid::new_v4(),
            name: "Dana Whitfield".into(),
            phone_number: "+15550009999".into(),
            email: None,
            attributes: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        store.insert_lead(&lead).await.unwrap();
        let conversation = store.create_conversation(lead.id, state, now).await.unwrap();

        let config = fast_config();
        let composer = Composer::new(None, &config);
        let sender = OutboundSender::new(
            store.clone(),
            transport,
            composer,
            Arc::new(ManualClock::new(now)),
            config,
        );
        (sender, store, conversation.id)
    }

    #[tokio::test]
    async fn send_persists_message_and_engages() {
        let transport = ScriptedTransport::failing_times(0);
        let (sender, store, conversation_id) =
            setup(transport.clone(), ConversationState::New).await;

        let message = sender
            .compose_and_send(conversation_id, ComposeTrigger::InitialOutreach)
            .await
            .unwrap();
        assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
        assert!(message.transport_id.is_some());

        let conversation = store.get_conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.state, ConversationState::Engaged);
        assert!(conversation.last_contact.is_some());
        // The template fallback always carries the booking link.
        assert!(conversation.booking_link_sent);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let transport = ScriptedTransport::failing_times(2);
        let (sender, _store, conversation_id) =
            setup(transport.clone(), ConversationState::Engaged).await;

        sender
            .compose_and_send(conversation_id, ComposeTrigger::Reply)
            .await
            .unwrap();
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_record_failure() {
        let transport = ScriptedTransport::failing_times(10);
        let (sender, store, conversation_id) =
            setup(transport.clone(), ConversationState::Engaged).await;

        let err = sender
            .compose_and_send(conversation_id, ComposeTrigger::Reply)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(transport.call_count(), 3);

        let conversation = store.get_conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.delivery_failures, 1);
        // Still engaged: a delivery failure is not a state transition.
        assert_eq!(conversation.state, ConversationState::Engaged);

        let log = store.messages_for_conversation(conversation_id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].delivery_status, DeliveryStatus::Failed);
        assert!(log[0].delivery_error.is_some());
    }

    #[tokio::test]
    async fn terminal_conversation_rejected_before_transport() {
        let transport = ScriptedTransport::failing_times(0);
        let (sender, _store, conversation_id) =
            setup(transport.clone(), ConversationState::OptedOut).await;

        let err = sender
            .compose_and_send(conversation_id, ComposeTrigger::Reply)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transition(_)));
        assert_eq!(transport.call_count(), 0);
    }

    struct OptOutWhileComposing {
        store: Arc<LibSqlStore>,
        conversation_id: Uuid,
    }

    #[async_trait]
    impl LlmProvider for OptOutWhileComposing {
        fn model_name(&self) -> &str {
            "test-model"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, LlmError> {
            // The opt-out pipeline writes through the store CAS without
            // taking the lead's slot, exactly as in production.
            self.store
                .transition_state(
                    self.conversation_id,
                    ConversationState::Engaged,
                    ConversationState::OptedOut,
                    Utc::now(),
                )
                .await
                .unwrap();
            Ok(CompletionResponse {
                content: "Happy to help, want to grab a time?".into(),
            })
        }
    }

    #[tokio::test]
    async fn opt_out_during_composition_blocks_the_send() {
        let transport = ScriptedTransport::failing_times(0);
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let now = Utc::now();
        let lead = Lead {
            id: Uuid::new_v4(),
            name: "Dana Whitfield".into(),
            phone_number: "+15550009999".into(),
            email: None,
            attributes: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        store.insert_lead(&lead).await.unwrap();
        let conversation = store
            .create_conversation(lead.id, ConversationState::Engaged, now)
            .await
            .unwrap();

        let config = fast_config();
        let llm: Arc<dyn LlmProvider> = Arc::new(OptOutWhileComposing {
            store: store.clone(),
            conversation_id: conversation.id,
        });
        let sender = OutboundSender::new(
            store.clone(),
            transport.clone(),
            Composer::new(Some(llm), &config),
            Arc::new(ManualClock::new(now)),
            config,
        );

        let err = sender
            .compose_and_send(conversation.id, ComposeTrigger::Reply)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transition(_)));
        assert_eq!(transport.call_count(), 0);

        let conversation = store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.state, ConversationState::OptedOut);
        // Nothing was recorded against the opted-out conversation.
        assert!(store
            .messages_for_conversation(conversation.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn raw_send_detects_booking_link() {
        let transport = ScriptedTransport::failing_times(0);
        let (sender, store, conversation_id) =
            setup(transport.clone(), ConversationState::Engaged).await;

        let link = EngineConfig::default().booking_link;
        sender
            .send_raw(conversation_id, &format!("Here you go: {link}"))
            .await
            .unwrap();

        let conversation = store.get_conversation(conversation_id).await.unwrap().unwrap();
        assert!(conversation.booking_link_sent);
    }
}
