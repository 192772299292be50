//! Message processing: classification, composition, inbound handling.

pub mod classifier;
pub mod composer;
pub mod inbound;

pub use classifier::IntentClassifier;
pub use composer::{ComposeTrigger, ComposedMessage, Composer};
pub use inbound::{InboundOutcome, InboundPipeline};
