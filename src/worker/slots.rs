//! Per-lead execution slots.
//!
//! The scheduler and the inbound pipeline both act on conversations;
//! a slot guarantees at most one of them is executing the send path
//! for a given lead at any moment. Acquisition is try-only: a busy
//! slot is reported to the caller, never waited on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Keyed mutual exclusion over lead ids.
///
/// Uses a std `Mutex` rather than tokio's: the critical section is a
/// `HashSet` insert or remove and never crosses an await point.
#[derive(Clone, Default)]
pub struct LeadSlots {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl LeadSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the slot for `lead_id`. Returns `None` when another
    /// task already holds it. The slot releases when the guard drops.
    pub fn try_acquire(&self, lead_id: Uuid) -> Option<SlotGuard> {
        let mut held = self.held.lock().unwrap();
        if held.insert(lead_id) {
            Some(SlotGuard {
                slots: self.held.clone(),
                lead_id,
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    fn is_held(&self, lead_id: Uuid) -> bool {
        self.held.lock().unwrap().contains(&lead_id)
    }
}

/// RAII guard for a claimed lead slot.
pub struct SlotGuard {
    slots: Arc<Mutex<HashSet<Uuid>>>,
    lead_id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.lock().unwrap().remove(&self.lead_id);
    }
}
