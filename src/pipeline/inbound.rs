//! Inbound webhook pipeline.
//!
//! Every inbound SMS flows through here: dedup on the transport message
//! id, lead lookup, classification, a state machine event, persistence,
//! then either an immediate reply (when the lead's execution slot is
//! free) or a deferred one via the `reply_due` flag. The message is
//! persisted only after its transition lands, so a failed write never
//! turns the transport's retry into a dedup hit.
//!
//! Messages from unknown numbers are audited, never dropped silently.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, TransitionError};
use crate::machine::{self, Effect, Event, Intent};
use crate::model::{Conversation, ConversationState, DeliveryStatus, Direction, Lead};
use crate::pipeline::classifier::IntentClassifier;
use crate::pipeline::composer::ComposeTrigger;
use crate::store::{ConversationFilter, NewMessage, Store};
use crate::transport::InboundSms;
use crate::worker::outbound::OutboundSender;
use crate::worker::slots::LeadSlots;

/// What the pipeline did with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Same transport message id was already processed.
    Duplicate,
    /// Sender's number matches no known lead; the message was audited.
    UnknownSender,
    /// Lead's conversation is terminal; the message was logged but had
    /// no effect.
    TerminalIgnored,
    /// The state machine had no edge for this event; logged, no effect.
    Ignored,
    /// Lead opted out. No reply is ever sent.
    OptedOut,
    /// Lead confirmed the booking.
    BookingCompleted,
    /// A reply was composed and sent inline.
    Replied,
    /// The lead's slot was busy; a reply will go out on the next sweep.
    ReplyDeferred,
}

pub struct InboundPipeline {
    store: Arc<dyn Store>,
    classifier: IntentClassifier,
    sender: Arc<OutboundSender>,
    slots: LeadSlots,
    clock: Arc<dyn Clock>,
}

impl InboundPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: IntentClassifier,
        sender: Arc<OutboundSender>,
        slots: LeadSlots,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            classifier,
            sender,
            slots,
            clock,
        }
    }

    pub async fn handle(&self, sms: InboundSms) -> Result<InboundOutcome> {
        let now = self.clock.now();

        // Webhook replay protection: the transport retries deliveries,
        // so the message id must be idempotent.
        if self
            .store
            .get_message_by_transport_id(&sms.message_sid)
            .await?
            .is_some()
        {
            debug!(transport_id = %sms.message_sid, "Duplicate webhook delivery ignored");
            return Ok(InboundOutcome::Duplicate);
        }

        let Some(lead) = self.store.get_lead_by_phone(&sms.from).await? else {
            warn!(from = %sms.from, "Inbound from unknown number, auditing");
            self.store
                .record_unmatched_inbound(&sms.from, &sms.body, &sms.message_sid, now)
                .await?;
            return Ok(InboundOutcome::UnknownSender);
        };

        let conversation = match self.conversation_for(&lead, now).await? {
            Found::Active(conversation) => conversation,
            Found::Terminal(conversation) => {
                // Keep the audit trail complete even after booked or
                // opted-out; the message changes nothing.
                self.persist_inbound(conversation.id, &sms, now).await?;
                info!(
                    conversation_id = %conversation.id,
                    state = %conversation.state,
                    "Inbound on terminal conversation logged and ignored"
                );
                return Ok(InboundOutcome::TerminalIgnored);
            }
        };

        let intent = self.classifier.classify(&sms.body).await;
        let (conversation, step) = self.apply_inbound_event(conversation, intent).await?;

        // The transition is durable before the message is. If the write
        // above failed, nothing matched the dedup check yet, so the
        // transport's retried delivery reprocesses the event in full.
        self.persist_inbound(conversation.id, &sms, now).await?;
        self.store.record_inbound_contact(conversation.id, now).await?;

        info!(
            conversation_id = %conversation.id,
            lead_id = %lead.id,
            intent = intent.as_str(),
            "Inbound message processed"
        );

        match step {
            Step::Transitioned(effect) => self.run_effect(&lead, &conversation, effect).await,
            Step::TerminalState => Ok(InboundOutcome::TerminalIgnored),
            Step::NoEdge => Ok(InboundOutcome::Ignored),
        }
    }

    /// Apply the inbound event, with one CAS retry. Returns the
    /// conversation as last read together with the machine's decision.
    async fn apply_inbound_event(
        &self,
        mut conversation: Conversation,
        intent: Intent,
    ) -> Result<(Conversation, Step)> {
        let event = Event::Inbound(intent);

        // One CAS retry: a scheduler send may move the state between
        // our read and the write, in which case the event re-applies
        // against the fresh state.
        for attempt in 0..2 {
            let transition = match machine::apply(conversation.state, event) {
                Ok(t) => t,
                Err(TransitionError::Terminal { state }) => {
                    info!(conversation_id = %conversation.id, %state, "Event on terminal state ignored");
                    return Ok((conversation, Step::TerminalState));
                }
                Err(e @ TransitionError::Undefined { .. }) => {
                    warn!(conversation_id = %conversation.id, "Inbound event ignored: {e}");
                    return Ok((conversation, Step::NoEdge));
                }
            };

            let now = self.clock.now();
            let applied = self
                .store
                .transition_state(conversation.id, conversation.state, transition.next, now)
                .await?;
            if applied {
                conversation.state = transition.next;
                return Ok((conversation, Step::Transitioned(transition.effect)));
            }

            warn!(
                conversation_id = %conversation.id,
                attempt,
                "State moved during inbound processing, re-reading"
            );
            conversation = self
                .store
                .get_conversation(conversation.id)
                .await?
                .ok_or(crate::error::Error::ConversationNotFound(conversation.id))?;
        }

        // Two lost races in a row means another writer owns this
        // conversation right now. Nothing was persisted, so the
        // transport's retry reprocesses the event from scratch.
        warn!(conversation_id = %conversation.id, "Giving up on inbound event after contention");
        Err(crate::error::PipelineError::TransitionRace(conversation.id).into())
    }

    async fn run_effect(
        &self,
        lead: &Lead,
        conversation: &Conversation,
        effect: Effect,
    ) -> Result<InboundOutcome> {
        match effect {
            Effect::StopScheduling => {
                info!(conversation_id = %conversation.id, lead_id = %lead.id, "Lead opted out");
                Ok(InboundOutcome::OptedOut)
            }
            Effect::CompleteBooking => {
                self.store.set_booking_completed(conversation.id).await?;
                info!(conversation_id = %conversation.id, lead_id = %lead.id, "Booking completed");
                Ok(InboundOutcome::BookingCompleted)
            }
            Effect::ScheduleReply => match self.slots.try_acquire(lead.id) {
                Some(_guard) => {
                    self.sender
                        .compose_and_send(conversation.id, ComposeTrigger::Reply)
                        .await?;
                    Ok(InboundOutcome::Replied)
                }
                None => {
                    debug!(lead_id = %lead.id, "Lead slot busy, deferring reply");
                    self.store.set_reply_due(conversation.id, true).await?;
                    Ok(InboundOutcome::ReplyDeferred)
                }
            },
            Effect::None | Effect::PauseActiveScheduling => Ok(InboundOutcome::Ignored),
        }
    }

    /// The lead's active conversation, a fresh one if they never had
    /// any, or their latest terminal one.
    async fn conversation_for(
        &self,
        lead: &Lead,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Found> {
        if let Some(conversation) = self.store.active_conversation_for_lead(lead.id).await? {
            return Ok(Found::Active(conversation));
        }

        let past = self
            .store
            .list_conversations(&ConversationFilter {
                state: None,
                lead_id: Some(lead.id),
            })
            .await?;
        if let Some(latest) = past.into_iter().next() {
            return Ok(Found::Terminal(latest));
        }

        let conversation = self
            .store
            .create_conversation(lead.id, ConversationState::New, now)
            .await?;
        Ok(Found::Active(conversation))
    }

    async fn persist_inbound(
        &self,
        conversation_id: uuid::Uuid,
        sms: &InboundSms,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.store
            .insert_message(NewMessage {
                conversation_id,
                direction: Direction::Inbound,
                body: &sms.body,
                sent_at: now,
                delivery_status: DeliveryStatus::Delivered,
                delivery_error: None,
                transport_id: Some(&sms.message_sid),
            })
            .await?;
        Ok(())
    }
}

/// Resolution of a lead's conversation for inbound processing.
enum Found {
    Active(Conversation),
    Terminal(Conversation),
}

/// What the state machine did with an inbound event.
enum Step {
    Transitioned(Effect),
    TerminalState,
    NoEdge,
}
