//! End-to-end scenarios over the engine facade: in-memory store, mock
//! transport, manual clock, no LLM (rules and templates only).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use reengage::clock::{Clock, ManualClock};
use reengage::config::EngineConfig;
use reengage::engine::Engine;
use reengage::error::{Error, TransportError};
use reengage::model::{ConversationState, Direction, Lead};
use reengage::pipeline::InboundOutcome;
use reengage::store::{ConversationFilter, LibSqlStore, Store};
use reengage::transport::{DeliveryReceipt, InboundSms, SmsTransport};

struct MockTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SmsTransport for MockTransport {
    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, TransportError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(DeliveryReceipt {
            transport_id: Some(format!("SMmock{}", sent.len())),
        })
    }
}

struct Harness {
    engine: Engine,
    store: Arc<LibSqlStore>,
    transport: Arc<MockTransport>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(EngineConfig {
            booking_link: "https://cal.example.com/book".into(),
            ..EngineConfig::default()
        })
        .await
    }

    async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Engine::new(
            store.clone(),
            transport.clone(),
            None,
            clock.clone(),
            config,
        );
        Self {
            engine,
            store,
            transport,
            clock,
        }
    }

    async fn add_lead(&self, name: &str, phone: &str) -> Lead {
        let now = self.clock.now();
        let lead = Lead {
            id: Uuid::new_v4(),
            name: name.into(),
            phone_number: phone.into(),
            email: None,
            attributes: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_lead(&lead).await.unwrap();
        lead
    }

    async fn conversation_state(&self, lead: &Lead) -> ConversationState {
        let conversations = self
            .store
            .list_conversations(&ConversationFilter {
                state: None,
                lead_id: Some(lead.id),
            })
            .await
            .unwrap();
        conversations[0].state
    }

    fn inbound(&self, lead: &Lead, body: &str, sid: &str) -> InboundSms {
        InboundSms {
            from: lead.phone_number.clone(),
            to: "+15550000000".into(),
            body: body.into(),
            message_sid: sid.into(),
        }
    }
}

#[tokio::test]
async fn first_contact_engages_the_lead() {
    let h = Harness::new().await;
    let lead = h.add_lead("Sam Ortiz", "+15551000001").await;
    h.store
        .create_conversation(lead.id, ConversationState::New, h.clock.now())
        .await
        .unwrap();

    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(h.conversation_state(&lead).await, ConversationState::Engaged);

    let sent = h.transport.sent();
    assert_eq!(sent[0].0, "+15551000001");
    assert!(!sent[0].1.is_empty());
    // Template outreach includes the booking link.
    assert!(sent[0].1.contains("https://cal.example.com/book"));
}

#[tokio::test]
async fn stop_opts_out_and_blocks_all_future_sends() {
    let h = Harness::new().await;
    let lead = h.add_lead("Renee Clark", "+15551000002").await;
    h.store
        .create_conversation(lead.id, ConversationState::Engaged, h.clock.now())
        .await
        .unwrap();

    let outcome = h
        .engine
        .handle_inbound_webhook(h.inbound(&lead, "STOP", "SM1"))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::OptedOut);
    assert_eq!(h.conversation_state(&lead).await, ConversationState::OptedOut);

    // Scheduler finds nothing to do for this lead, ever.
    h.clock.advance(chrono::Duration::days(30));
    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.sent, 0);

    // Manual sends are rejected explicitly.
    let err = h
        .engine
        .send_manual_message(lead.id, "are you sure?")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transition(_)));
    assert_eq!(h.transport.count(), 0);
}

#[tokio::test]
async fn booking_phrase_books_and_sets_flag() {
    let h = Harness::new().await;
    let lead = h.add_lead("Ivan Petrov", "+15551000003").await;
    h.store
        .create_conversation(lead.id, ConversationState::Engaged, h.clock.now())
        .await
        .unwrap();

    let outcome = h
        .engine
        .handle_inbound_webhook(h.inbound(&lead, "just booked a call for Friday", "SM1"))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::BookingCompleted);

    let conversations = h
        .engine
        .list_conversations(&ConversationFilter {
            state: Some(ConversationState::Booked),
            lead_id: Some(lead.id),
        })
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert!(conversations[0].booking_completed);

    // Booked is terminal: no replies, no scheduling.
    assert_eq!(h.transport.count(), 0);
    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.sent, 0);
}

#[tokio::test]
async fn webhook_replay_is_idempotent() {
    let h = Harness::new().await;
    let lead = h.add_lead("Mia Becker", "+15551000004").await;
    h.store
        .create_conversation(lead.id, ConversationState::Engaged, h.clock.now())
        .await
        .unwrap();

    let first = h
        .engine
        .handle_inbound_webhook(h.inbound(&lead, "what times are free?", "SMreplay"))
        .await
        .unwrap();
    assert_eq!(first, InboundOutcome::Replied);

    for _ in 0..3 {
        let outcome = h
            .engine
            .handle_inbound_webhook(h.inbound(&lead, "what times are free?", "SMreplay"))
            .await
            .unwrap();
        assert_eq!(outcome, InboundOutcome::Duplicate);
    }

    // Exactly one inbound message recorded, exactly one reply sent.
    let conversations = h
        .store
        .list_conversations(&ConversationFilter {
            state: None,
            lead_id: Some(lead.id),
        })
        .await
        .unwrap();
    let log = h
        .store
        .messages_for_conversation(conversations[0].id)
        .await
        .unwrap();
    let inbound_count = log.iter().filter(|m| m.direction == Direction::Inbound).count();
    assert_eq!(inbound_count, 1);
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn unresponsive_timeout_reengagement_and_revival() {
    let h = Harness::with_config(EngineConfig {
        booking_link: "https://cal.example.com/book".into(),
        max_reengagement_attempts: 2,
        ..EngineConfig::default()
    })
    .await;
    let lead = h.add_lead("Tess Nakamura", "+15551000005").await;
    let conversation = h
        .store
        .create_conversation(lead.id, ConversationState::New, h.clock.now())
        .await
        .unwrap();

    // Initial outreach engages.
    h.engine.sweep_once().await.unwrap();
    assert_eq!(h.conversation_state(&lead).await, ConversationState::Engaged);

    // Silence past the window: unresponsive.
    h.clock.advance(chrono::Duration::days(4));
    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.marked_unresponsive, 1);
    assert_eq!(
        h.conversation_state(&lead).await,
        ConversationState::Unresponsive
    );

    // Re-engagement nudges go out on cadence.
    h.clock.advance(chrono::Duration::days(3));
    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.sent, 1);

    // The lead answers: back to engaged, with a reply.
    let outcome = h
        .engine
        .handle_inbound_webhook(h.inbound(&lead, "sorry! still interested", "SMback"))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::Replied);
    assert_eq!(h.conversation_state(&lead).await, ConversationState::Engaged);

    let fetched = h.store.get_conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(fetched.reengagement_attempts, 1);
}

#[tokio::test]
async fn reengagement_stops_for_good_after_cap() {
    let h = Harness::with_config(EngineConfig {
        booking_link: "https://cal.example.com/book".into(),
        max_reengagement_attempts: 1,
        ..EngineConfig::default()
    })
    .await;
    let lead = h.add_lead("Omar Said", "+15551000006").await;
    let conversation = h
        .store
        .create_conversation(lead.id, ConversationState::Unresponsive, h.clock.now())
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::days(3));
    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.sent, 1);

    h.clock.advance(chrono::Duration::days(90));
    let stats = h.engine.sweep_once().await.unwrap();
    assert_eq!(stats.sent, 0);
    assert_eq!(h.transport.count(), 1);

    let fetched = h.store.get_conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(fetched.reengagement_attempts, 1);
    assert_eq!(fetched.state, ConversationState::Unresponsive);
}

#[tokio::test]
async fn one_active_conversation_per_lead_end_to_end() {
    let h = Harness::new().await;
    let lead = h.add_lead("Greta Lindqvist", "+15551000007").await;

    // Inbound with no prior conversation creates one.
    h.engine
        .handle_inbound_webhook(h.inbound(&lead, "hi, got your voicemail", "SM1"))
        .await
        .unwrap();

    // A second active conversation cannot be created underneath it.
    let err = h
        .store
        .create_conversation(lead.id, ConversationState::New, h.clock.now())
        .await
        .unwrap_err();
    assert!(matches!(err, reengage::error::StoreError::Constraint(_)));

    // More inbound traffic lands on the same conversation.
    h.engine
        .handle_inbound_webhook(h.inbound(&lead, "any afternoon works", "SM2"))
        .await
        .unwrap();
    let conversations = h
        .store
        .list_conversations(&ConversationFilter {
            state: None,
            lead_id: Some(lead.id),
        })
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
}

#[tokio::test]
async fn every_outbound_body_is_non_empty_without_llm() {
    let h = Harness::new().await;
    for i in 0..3 {
        let lead = h.add_lead(&format!("Lead {i}"), &format!("+1555200000{i}")).await;
        h.store
            .create_conversation(lead.id, ConversationState::New, h.clock.now())
            .await
            .unwrap();
    }

    h.engine.sweep_once().await.unwrap();
    assert_eq!(h.transport.count(), 3);
    for (_, body) in h.transport.sent() {
        assert!(!body.trim().is_empty());
        assert!(body.chars().count() <= EngineConfig::default().max_body_chars);
    }
}

#[tokio::test]
async fn question_gets_an_immediate_reply() {
    let h = Harness::new().await;
    let lead = h.add_lead("Chen Wei", "+15551000008").await;
    h.store
        .create_conversation(lead.id, ConversationState::Engaged, h.clock.now())
        .await
        .unwrap();

    let outcome = h
        .engine
        .handle_inbound_webhook(h.inbound(&lead, "how long is the call?", "SMq"))
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::Replied);
    assert_eq!(h.transport.count(), 1);
    assert_eq!(h.conversation_state(&lead).await, ConversationState::Engaged);
}

#[tokio::test]
async fn unknown_number_is_audited_and_acknowledged() {
    let h = Harness::new().await;
    let outcome = h
        .engine
        .handle_inbound_webhook(InboundSms {
            from: "+19995550000".into(),
            to: "+15550000000".into(),
            body: "who dis".into(),
            message_sid: "SMwho".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, InboundOutcome::UnknownSender);
    assert_eq!(h.transport.count(), 0);
}

#[tokio::test]
async fn scheduler_loop_runs_and_stops() {
    let h = Harness::with_config(EngineConfig {
        booking_link: "https://cal.example.com/book".into(),
        sweep_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    })
    .await;
    let lead = h.add_lead("Bo Lindgren", "+15551000009").await;
    h.store
        .create_conversation(lead.id, ConversationState::New, h.clock.now())
        .await
        .unwrap();

    assert!(h.engine.start_scheduler());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.engine.stop_scheduler());

    assert_eq!(h.transport.count(), 1);
    assert_eq!(h.conversation_state(&lead).await, ConversationState::Engaged);
}
