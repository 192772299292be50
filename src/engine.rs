//! Engine facade.
//!
//! Owns the wired-together subsystems and exposes the operations the
//! HTTP layer calls. Manual sends go through the same slot and state
//! machine discipline as scheduled ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::llm::LlmProvider;
use crate::model::{Conversation, ConversationState, Lead, Message};
use crate::pipeline::{Composer, InboundOutcome, InboundPipeline, IntentClassifier};
use crate::store::{ConversationFilter, Store};
use crate::transport::{InboundSms, SmsTransport};
use crate::worker::{LeadSlots, OutboundSender, Scheduler};

pub struct Engine {
    store: Arc<dyn Store>,
    pipeline: InboundPipeline,
    sender: Arc<OutboundSender>,
    scheduler: Arc<Scheduler>,
    slots: LeadSlots,
    clock: Arc<dyn Clock>,
    running: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn SmsTransport>,
        llm: Option<Arc<dyn LlmProvider>>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let slots = LeadSlots::new();
        let sender = Arc::new(OutboundSender::new(
            store.clone(),
            transport,
            Composer::new(llm.clone(), &config),
            clock.clone(),
            config.clone(),
        ));
        let pipeline = InboundPipeline::new(
            store.clone(),
            IntentClassifier::new(llm),
            sender.clone(),
            slots.clone(),
            clock.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            sender.clone(),
            slots.clone(),
            clock.clone(),
            config,
        ));

        Self {
            store,
            pipeline,
            sender,
            scheduler,
            slots,
            clock,
            running: Mutex::new(None),
        }
    }

    pub async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>> {
        Ok(self.store.list_conversations(filter).await?)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or(Error::ConversationNotFound(id))
    }

    pub async fn get_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        // NotFound beats an empty list for a bad id.
        self.get_conversation(conversation_id).await?;
        Ok(self.store.messages_for_conversation(conversation_id).await?)
    }

    pub async fn get_lead(&self, id: Uuid) -> Result<Lead> {
        self.store.get_lead(id).await?.ok_or(Error::LeadNotFound(id))
    }

    /// Send an operator-written message to a lead, outside the
    /// composer but inside the slot and state machine discipline. A
    /// lead with only a terminal conversation is rejected; a lead with
    /// no conversation at all gets a fresh one.
    pub async fn send_manual_message(&self, lead_id: Uuid, body: &str) -> Result<Message> {
        let lead = self.get_lead(lead_id).await?;

        let conversation = match self.store.active_conversation_for_lead(lead.id).await? {
            Some(conversation) => conversation,
            None => {
                let past = self
                    .store
                    .list_conversations(&ConversationFilter {
                        state: None,
                        lead_id: Some(lead.id),
                    })
                    .await?;
                if let Some(latest) = past.into_iter().next() {
                    return Err(crate::error::TransitionError::Terminal {
                        state: latest.state,
                    }
                    .into());
                }
                self.store
                    .create_conversation(lead.id, ConversationState::New, self.clock.now())
                    .await?
            }
        };

        let _guard = self
            .slots
            .try_acquire(lead.id)
            .ok_or(Error::SlotBusy(lead.id))?;
        self.sender.send_raw(conversation.id, body).await
    }

    pub async fn handle_inbound_webhook(&self, sms: InboundSms) -> Result<InboundOutcome> {
        self.pipeline.handle(sms).await
    }

    /// Start the background sweep loop. Returns false when already
    /// running.
    pub fn start_scheduler(&self) -> bool {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return false;
        }
        *running = Some(self.scheduler.clone().spawn());
        true
    }

    /// Signal the sweep loop to stop after its current pass. Returns
    /// false when it was not running.
    pub fn stop_scheduler(&self) -> bool {
        let mut running = self.running.lock().unwrap();
        match running.take() {
            Some((_handle, shutdown)) => {
                shutdown.store(true, Ordering::Relaxed);
                info!("Scheduler stop requested");
                true
            }
            None => false,
        }
    }

    pub fn scheduler_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// Run one sweep inline. Used by tests and operational tooling.
    pub async fn sweep_once(&self) -> Result<crate::worker::SweepStats> {
        self.scheduler.sweep_once().await
    }
}
