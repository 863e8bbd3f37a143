//! Per-record pipeline guards
//!
//! At most one pipeline writes to a record at a time. The guard also carries
//! the record's cancellation flag, which pipelines check between stages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::PilotError;

#[derive(Debug, Default)]
struct Slot {
    cancelled: AtomicBool,
}

type Slots = Arc<Mutex<HashMap<String, Arc<Slot>>>>;

/// Registry of records with an active pipeline
#[derive(Debug, Clone, Default)]
pub struct RecordLocks {
    slots: Slots,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the record, or fail with `Conflict` if a pipeline already holds it
    pub fn acquire(&self, id: &str) -> Result<RecordGuard, PilotError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(id) {
            return Err(PilotError::Conflict(format!(
                "{} already has a pipeline in progress",
                id
            )));
        }
        let slot = Arc::new(Slot::default());
        slots.insert(id.to_string(), slot.clone());
        Ok(RecordGuard {
            id: id.to_string(),
            slot,
            slots: self.slots.clone(),
        })
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Flag the active pipeline for `id` as cancelled. Returns false when no
    /// pipeline holds the record.
    pub fn cancel(&self, id: &str) -> bool {
        match self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
        {
            Some(slot) => {
                slot.cancelled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Exclusive claim on one record; released on drop
#[derive(Debug)]
pub struct RecordGuard {
    id: String,
    slot: Arc<Slot>,
    slots: Slots,
}

impl RecordGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots
            .get(&self.id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot))
        {
            slots.remove(&self.id);
        }
    }
}
