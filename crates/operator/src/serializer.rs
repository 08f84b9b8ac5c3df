//! Per-key serialization of reconciles.
//!
//! Reconciles for one key run one at a time; different keys run in
//! parallel. A reconcile that is still waiting when a newer one is queued
//! for the same key is skipped, since the newer one reads fresher state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::key::ObjectKey;

#[derive(Debug, Default)]
struct Slot {
    lock: tokio::sync::Mutex<()>,
    latest: AtomicU64,
}

#[derive(Debug, Default)]
pub struct KeyedSerializer {
    slots: Mutex<HashMap<ObjectKey, Arc<Slot>>>,
}

/// A claim on the next run for one key.
#[derive(Debug)]
pub struct Ticket {
    slot: Arc<Slot>,
    sequence: u64,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self, key: &ObjectKey) -> Ticket {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let sequence = slot.latest.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket { slot, sequence }
    }

    /// Forget a deleted key. Runs already holding a ticket finish normally.
    pub fn release(&self, key: &ObjectKey) {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }

    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Ticket {
    /// Run `f` under the key's lock. Returns `None` without running it if a
    /// newer ticket was issued while this one waited.
    pub async fn run<F, Fut, T>(self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.slot.lock.lock().await;
        if self.slot.latest.load(Ordering::SeqCst) != self.sequence {
            return None;
        }
        Some(f().await)
    }
}
