//! Conversation state machine.
//!
//! The authoritative per-lead lifecycle. `apply` is a pure function of
//! (current state, event) so every allowed edge is enumerable and
//! testable; persistence of the resulting transition happens elsewhere
//! through the store's atomic check-state-and-swap.
//!
//! Terminal states (`booked`, `opted_out`) reject every event with an
//! explicit error so a misbehaving caller shows up in logs and tests
//! instead of being silently ignored.

use crate::error::TransitionError;
use crate::model::ConversationState;

/// Classified intent of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Lead asked to stop all contact. Permanent, compliance-mandated,
    /// and pre-empts every other classification.
    OptOut,
    /// Lead confirmed they booked the call.
    BookingConfirmed,
    /// Lead asked a question that needs an answer.
    Question,
    /// Anything else worth replying to.
    Generic,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptOut => "opt_out",
            Self::BookingConfirmed => "booking_confirmed",
            Self::Question => "question",
            Self::Generic => "generic",
        }
    }
}

/// An event submitted to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An outbound message was successfully handed to the transport.
    OutboundSent,
    /// An inbound message arrived and was classified.
    Inbound(Intent),
    /// No inbound activity within the configured window.
    ContactWindowElapsed,
    /// Re-engagement attempts reached the configured cap.
    ReengagementExhausted,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutboundSent => f.write_str("outbound_sent"),
            Self::Inbound(intent) => write!(f, "inbound({})", intent.as_str()),
            Self::ContactWindowElapsed => f.write_str("contact_window_elapsed"),
            Self::ReengagementExhausted => f.write_str("reengagement_exhausted"),
        }
    }
}

/// Side-effect instruction attached to an accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing beyond the state write.
    None,
    /// A reply should be composed and sent (immediately if the lead's
    /// execution slot is free, otherwise on the next sweep).
    ScheduleReply,
    /// Set `booking_completed` and stop scheduling for good.
    CompleteBooking,
    /// Stop all scheduling for this conversation, permanently.
    StopScheduling,
    /// Stop active scheduling but keep periodic re-engagement attempts.
    PauseActiveScheduling,
}

/// An accepted transition: the next state plus what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ConversationState,
    pub effect: Effect,
}

impl Transition {
    fn new(next: ConversationState, effect: Effect) -> Self {
        Self { next, effect }
    }
}

/// Apply an event to a conversation state.
///
/// Returns the transition to persist, or an explicit rejection for
/// terminal states and undefined edges.
pub fn apply(state: ConversationState, event: Event) -> Result<Transition, TransitionError> {
    use ConversationState::*;
    use Effect::*;

    if state.is_terminal() {
        return Err(TransitionError::Terminal { state });
    }

    // Opt-out is reachable from every non-terminal state and takes
    // priority over anything else the classifier produced.
    if let Event::Inbound(Intent::OptOut) = event {
        return Ok(Transition::new(OptedOut, StopScheduling));
    }

    let transition = match (state, event) {
        (New, Event::OutboundSent) => Transition::new(Engaged, None),
        // Replies and re-engagement attempts do not themselves change
        // state; only inbound activity revives an unresponsive lead.
        (Engaged, Event::OutboundSent) => Transition::new(Engaged, None),
        (Unresponsive, Event::OutboundSent) => Transition::new(Unresponsive, None),

        // A conversation may be created by the inbound pipeline before
        // any outbound was sent; a lead who writes first is engaged.
        (New, Event::Inbound(Intent::Generic | Intent::Question)) => {
            Transition::new(Engaged, ScheduleReply)
        }
        (Engaged, Event::Inbound(Intent::Generic | Intent::Question)) => {
            Transition::new(Engaged, ScheduleReply)
        }
        (Engaged, Event::Inbound(Intent::BookingConfirmed)) => {
            Transition::new(Booked, CompleteBooking)
        }
        // Any inbound revives an unresponsive conversation; a booking
        // confirmation then completes on the next engaged-state message.
        (Unresponsive, Event::Inbound(_)) => Transition::new(Engaged, ScheduleReply),

        (Engaged, Event::ContactWindowElapsed) => {
            Transition::new(Unresponsive, PauseActiveScheduling)
        }
        (Unresponsive, Event::ReengagementExhausted) => {
            Transition::new(Unresponsive, StopScheduling)
        }

        (state, event) => {
            return Err(TransitionError::Undefined {
                state,
                event: event.to_string(),
            });
        }
    };

    Ok(transition)
}
