//! Outbound scheduler.
//!
//! A periodic sweep over all non-terminal conversations. Each sweep
//! evaluates dueness per conversation, sends at most
//! `max_sends_per_sweep` messages globally, and moves stale engaged
//! conversations to unresponsive. Sends go through the shared
//! `OutboundSender`, under the lead's execution slot; a busy slot means
//! the conversation waits for the next sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::machine::{self, Event};
use crate::model::{Conversation, ConversationState};
use crate::pipeline::composer::ComposeTrigger;
use crate::store::Store;
use crate::worker::outbound::OutboundSender;
use crate::worker::slots::LeadSlots;

/// What one sweep did. Returned for observability and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub sent: usize,
    pub marked_unresponsive: usize,
    pub exhausted: usize,
    pub skipped_busy: usize,
    pub skipped_throttled: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    sender: Arc<OutboundSender>,
    slots: LeadSlots,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<OutboundSender>,
        slots: LeadSlots,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            sender,
            slots,
            clock,
            config,
        }
    }

    /// Spawn the sweep loop. Returns a `JoinHandle` and a shutdown
    /// flag; set the flag to stop after the current sweep.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                "Scheduler started, sweeping every {}s",
                self.config.sweep_interval.as_secs()
            );

            let mut tick = tokio::time::interval(self.config.sweep_interval);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!("Scheduler shutting down");
                    return;
                }

                match self.sweep_once().await {
                    Ok(stats) if stats.sent > 0 || stats.marked_unresponsive > 0 => {
                        info!(
                            examined = stats.examined,
                            sent = stats.sent,
                            marked_unresponsive = stats.marked_unresponsive,
                            "Sweep complete"
                        );
                    }
                    Ok(stats) => {
                        debug!(examined = stats.examined, "Sweep complete, nothing due");
                    }
                    Err(e) => error!("Sweep failed: {e}"),
                }
            }
        });

        (handle, shutdown_flag)
    }

    /// Run one sweep over all active conversations.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let now = self.clock.now();
        let conversations = self.store.list_active_conversations().await?;
        let mut stats = SweepStats {
            examined: conversations.len(),
            ..SweepStats::default()
        };

        for conversation in conversations {
            match self.evaluate(&conversation, now) {
                Due::Nothing => {}
                Due::MarkUnresponsive => {
                    self.mark_unresponsive(&conversation, now).await;
                    stats.marked_unresponsive += 1;
                }
                Due::Send(trigger) => {
                    if stats.sent >= self.config.max_sends_per_sweep {
                        stats.skipped_throttled += 1;
                        continue;
                    }
                    if self.send_one(&conversation, trigger, &mut stats).await {
                        stats.sent += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Dueness decision for one conversation. Pure function of the
    /// snapshot and the clock; the send path re-validates state later.
    fn evaluate(&self, conversation: &Conversation, now: DateTime<Utc>) -> Due {
        let last_contact = conversation.last_contact.unwrap_or(conversation.created_at);
        let since_contact = now.signed_duration_since(last_contact);

        match conversation.state {
            ConversationState::New => {
                if conversation.last_contact.is_none() {
                    Due::Send(ComposeTrigger::InitialOutreach)
                } else {
                    Due::Nothing
                }
            }
            ConversationState::Engaged => {
                if conversation.reply_due {
                    if since_contact >= to_chrono(self.config.per_lead_interval) {
                        Due::Send(ComposeTrigger::Reply)
                    } else {
                        Due::Nothing
                    }
                } else if since_contact >= to_chrono(self.config.unresponsive_after) {
                    Due::MarkUnresponsive
                } else {
                    Due::Nothing
                }
            }
            ConversationState::Unresponsive => {
                if conversation.reengagement_attempts >= self.config.max_reengagement_attempts {
                    Due::Nothing
                } else if since_contact >= to_chrono(self.config.reengagement_interval) {
                    Due::Send(ComposeTrigger::Reengagement)
                } else {
                    Due::Nothing
                }
            }
            // Terminal states never reach the sweep; the active list
            // excludes them.
            ConversationState::Booked | ConversationState::OptedOut => Due::Nothing,
        }
    }

    async fn mark_unresponsive(&self, conversation: &Conversation, now: DateTime<Utc>) {
        let transition = match machine::apply(conversation.state, Event::ContactWindowElapsed) {
            Ok(t) => t,
            Err(e) => {
                warn!(conversation_id = %conversation.id, "Stale-contact transition rejected: {e}");
                return;
            }
        };
        match self
            .store
            .transition_state(conversation.id, conversation.state, transition.next, now)
            .await
        {
            Ok(true) => {
                info!(conversation_id = %conversation.id, "Conversation marked unresponsive");
            }
            Ok(false) => {
                debug!(conversation_id = %conversation.id, "State moved before stale-contact write");
            }
            Err(e) => error!(conversation_id = %conversation.id, "Stale-contact write failed: {e}"),
        }
    }

    /// Send under the lead's slot. Returns true when a message went out.
    async fn send_one(
        &self,
        conversation: &Conversation,
        trigger: ComposeTrigger,
        stats: &mut SweepStats,
    ) -> bool {
        let Some(_guard) = self.slots.try_acquire(conversation.lead_id) else {
            debug!(lead_id = %conversation.lead_id, "Lead slot busy, skipping until next sweep");
            stats.skipped_busy += 1;
            return false;
        };

        match self.sender.compose_and_send(conversation.id, trigger).await {
            Ok(_) => {
                if trigger == ComposeTrigger::Reengagement {
                    if let Err(e) = self.record_reengagement_attempt(conversation).await {
                        error!(conversation_id = %conversation.id, "Attempt bookkeeping failed: {e}");
                    }
                }
                true
            }
            Err(e) => {
                // A state race or delivery failure ends this
                // conversation's turn, not the sweep.
                warn!(conversation_id = %conversation.id, "Scheduled send failed: {e}");
                false
            }
        }
    }

    async fn record_reengagement_attempt(&self, conversation: &Conversation) -> Result<()> {
        self.store
            .increment_reengagement_attempts(conversation.id)
            .await?;

        let attempts = conversation.reengagement_attempts + 1;
        if attempts >= self.config.max_reengagement_attempts {
            // One observable exhaustion event; after this the sweep
            // stops considering the conversation.
            let now = self.clock.now();
            if let Ok(transition) =
                machine::apply(ConversationState::Unresponsive, Event::ReengagementExhausted)
            {
                let _ = self
                    .store
                    .transition_state(
                        conversation.id,
                        ConversationState::Unresponsive,
                        transition.next,
                        now,
                    )
                    .await?;
            }
            info!(
                conversation_id = %conversation.id,
                attempts,
                "Re-engagement attempts exhausted, giving up on lead"
            );
        }
        Ok(())
    }
}

enum Due {
    Nothing,
    Send(ComposeTrigger),
    MarkUnresponsive,
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    use crate::clock::ManualClock;
    use crate::error::TransportError;
    use crate::model::Lead;
    use crate::pipeline::composer::Composer;
    use crate::store::LibSqlStore;
    use crate::transport::{DeliveryReceipt, SmsTransport};

    struct CountingTransport {
        sent: Mutex<Vec<String>>,
    }

    impl CountingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SmsTransport for CountingTransport {
        async fn send(
            &self,
            to: &str,
            _body: &str,
        ) -> std::result::Result<DeliveryReceipt, TransportError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(to.to_string());
            Ok(DeliveryReceipt {
                transport_id: Some(format!("SM{}", sent.len())),
            })
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<LibSqlStore>,
        transport: Arc<CountingTransport>,
        clock: Arc<ManualClock>,
        slots: LeadSlots,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let transport = CountingTransport::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let slots = LeadSlots::new();
        let sender = Arc::new(OutboundSender::new(
            store.clone(),
            transport.clone(),
            Composer::new(None, &config),
            clock.clone(),
            config.clone(),
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            sender,
            slots.clone(),
            clock.clone(),
            config,
        );
        Fixture {
            scheduler,
            store,
            transport,
            clock,
            slots,
        }
    }

    async fn add_lead(store: &LibSqlStore, phone: &str, state: ConversationState) -> Conversation {
        let now = Utc::now();
        let lead = Lead {
            id: Uuid::new_v4(),
            name: format!("Lead {phone}"),
            phone_number: phone.to_string(),
            email: None,
            attributes: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        store.insert_lead(&lead).await.unwrap();
        store.create_conversation(lead.id, state, now).await.unwrap()
    }

    #[tokio::test]
    async fn new_conversations_get_initial_outreach() {
        let f = fixture(EngineConfig::default()).await;
        add_lead(&f.store, "+15551110001", ConversationState::New).await;
        add_lead(&f.store, "+15551110002", ConversationState::New).await;

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(f.transport.count(), 2);

        // Outreach sent, leads are engaged, next sweep sends nothing.
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn sweep_respects_global_ceiling() {
        let config = EngineConfig {
            max_sends_per_sweep: 3,
            ..EngineConfig::default()
        };
        let f = fixture(config).await;
        for i in 0..5 {
            add_lead(&f.store, &format!("+1555222000{i}"), ConversationState::New).await;
        }

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.skipped_throttled, 2);

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(f.transport.count(), 5);
    }

    #[tokio::test]
    async fn stale_engaged_conversation_goes_unresponsive() {
        let f = fixture(EngineConfig::default()).await;
        let conversation = add_lead(&f.store, "+15553330001", ConversationState::Engaged).await;
        f.store
            .record_outbound_contact(conversation.id, f.clock.now())
            .await
            .unwrap();

        // Inside the window: nothing happens.
        f.clock.advance(chrono::Duration::days(1));
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.marked_unresponsive, 0);

        f.clock.advance(chrono::Duration::days(3));
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.marked_unresponsive, 1);

        let conversation = f.store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.state, ConversationState::Unresponsive);
    }

    #[tokio::test]
    async fn unresponsive_gets_reengagement_until_cap() {
        let config = EngineConfig {
            max_reengagement_attempts: 2,
            ..EngineConfig::default()
        };
        let f = fixture(config).await;
        let conversation =
            add_lead(&f.store, "+15554440001", ConversationState::Unresponsive).await;
        f.store
            .record_outbound_contact(conversation.id, f.clock.now())
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::days(3));
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 1);

        f.clock.advance(chrono::Duration::days(3));
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 1);

        // Cap reached: no more attempts, conversation stays put.
        f.clock.advance(chrono::Duration::days(30));
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 0);

        let conversation = f.store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.state, ConversationState::Unresponsive);
        assert_eq!(conversation.reengagement_attempts, 2);
        assert_eq!(f.transport.count(), 2);
    }

    #[tokio::test]
    async fn deferred_reply_sent_after_interval() {
        let config = EngineConfig {
            per_lead_interval: Duration::from_secs(60),
            ..EngineConfig::default()
        };
        let f = fixture(config).await;
        let conversation = add_lead(&f.store, "+15555550001", ConversationState::Engaged).await;
        f.store
            .record_outbound_contact(conversation.id, f.clock.now())
            .await
            .unwrap();
        f.store.set_reply_due(conversation.id, true).await.unwrap();

        // Too soon after the last outbound.
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 0);

        f.clock.advance(chrono::Duration::seconds(90));
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 1);

        // Sending cleared the flag.
        let conversation = f.store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert!(!conversation.reply_due);
    }

    #[tokio::test]
    async fn busy_slot_skips_until_next_sweep() {
        let f = fixture(EngineConfig::default()).await;
        let conversation = add_lead(&f.store, "+15556660001", ConversationState::New).await;

        let guard = f.slots.try_acquire(conversation.lead_id).unwrap();
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.skipped_busy, 1);

        drop(guard);
        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test]
    async fn opted_out_mid_sweep_is_not_messaged() {
        let f = fixture(EngineConfig::default()).await;
        let conversation = add_lead(&f.store, "+15557770001", ConversationState::New).await;

        // Opt-out lands after the sweep snapshot would have been taken.
        f.store
            .transition_state(
                conversation.id,
                ConversationState::New,
                ConversationState::OptedOut,
                f.clock.now(),
            )
            .await
            .unwrap();

        let stats = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(stats.sent, 0);
        assert_eq!(f.transport.count(), 0);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown_flag() {
        let f = fixture(EngineConfig {
            sweep_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        })
        .await;
        let scheduler = Arc::new(f.scheduler);
        let (handle, shutdown) = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
