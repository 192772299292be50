//! Background scheduling and the shared outbound send path.

pub mod outbound;
pub mod scheduler;
pub mod slots;

pub use outbound::OutboundSender;
pub use scheduler::{Scheduler, SweepStats};
pub use slots::LeadSlots;
