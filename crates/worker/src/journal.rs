//! Ordered log of side effects, shared by the in-memory adapters.
//!
//! Tests attach one `Journal` to both the in-memory store and queue and then
//! assert on the interleaving of commits and acknowledgments.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Committed(Option<String>),
    Acked(Option<String>),
    Requeued(Option<String>),
    Rejected(Option<String>),
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}
