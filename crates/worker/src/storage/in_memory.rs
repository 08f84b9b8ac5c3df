//! In-memory record store for tests and benchmarks.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{NewRecord, RecordStore, StorageError};
use crate::journal::{Journal, JournalEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub record: NewRecord,
}

/// Keeps committed records in a vector.
///
/// Failures and latency can be injected to exercise the worker's ordering
/// and redelivery paths.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<Vec<StoredRecord>>,
    schema_ready: AtomicBool,
    failing_inserts: AtomicU32,
    schema_failures: AtomicU32,
    latency: Option<Duration>,
    journal: Option<Journal>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every insert sleeps for `latency` before committing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// The next `count` inserts fail with `Unavailable`.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// The next `count` schema preparations fail with `Unavailable`.
    pub fn fail_next_schema(&self, count: u32) {
        self.schema_failures.store(count, Ordering::SeqCst);
    }

    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn prepare_schema(&self) -> Result<(), StorageError> {
        if take_failure(&self.schema_failures) {
            return Err(StorageError::unavailable("prepare_schema", "injected failure"));
        }
        self.schema_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, record: &NewRecord) -> Result<i64, StorageError> {
        if !self.schema_ready() {
            return Err(StorageError::rejected(
                "insert_record",
                "relation \"payments\" does not exist",
            ));
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if take_failure(&self.failing_inserts) {
            return Err(StorageError::unavailable("insert_record", "injected failure"));
        }

        let id = {
            let mut records = self
                .records
                .lock()
                .map_err(|_| StorageError::unavailable("insert_record", "store lock poisoned"))?;
            let id = records.len() as i64 + 1;
            records.push(StoredRecord {
                id,
                record: record.clone(),
            });
            id
        };

        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Committed(record.message_id.clone()));
        }
        Ok(id)
    }

    async fn close(&self) {}
}
