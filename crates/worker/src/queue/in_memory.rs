//! In-memory queue for tests and benchmarks.
//!
//! Cloning yields another handle to the same queue, so a test can publish
//! and inspect while the worker consumes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Delivery, MessageQueue, Next, QueueError};
use crate::journal::{Journal, JournalEntry};

#[derive(Debug, Default)]
struct QueueState {
    declared: bool,
    cancelled: bool,
    ready: VecDeque<Delivery>,
    unsettled: Option<Delivery>,
    acked: Vec<Delivery>,
    rejected: Vec<(Delivery, String)>,
    requeued: u64,
    delivered: u64,
    next_tag: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    failing_reads: AtomicU32,
    failing_acks: AtomicU32,
    journal: Option<Journal>,
}

#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
    block: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self::build(Some(journal))
    }

    fn build(journal: Option<Journal>) -> Self {
        Self {
            shared: Arc::new(Shared {
                journal,
                ..Default::default()
            }),
            block: Duration::from_millis(50),
        }
    }

    /// How long `next` waits before reporting `Idle`.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.shared
            .state
            .lock()
            .map_err(|_| QueueError::command("lock", "queue state poisoned"))
    }

    fn journal(&self, entry: JournalEntry) {
        if let Some(journal) = &self.shared.journal {
            journal.record(entry);
        }
    }

    /// Append a message. Returns its delivery id.
    pub fn publish(&self, body: impl Into<Vec<u8>>, message_id: Option<&str>) -> String {
        let tag = {
            let Ok(mut state) = self.shared.state.lock() else {
                return String::new();
            };
            state.next_tag += 1;
            let tag = format!("{}-0", state.next_tag);
            state.ready.push_back(Delivery {
                delivery_id: tag.clone(),
                message_id: message_id.map(str::to_string),
                body: body.into(),
                redelivered: false,
            });
            tag
        };
        self.shared.notify.notify_one();
        tag
    }

    /// Simulate deletion of the queue: the consumer is cancelled once the
    /// ready messages are gone.
    pub fn cancel(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.cancelled = true;
        }
        self.shared.notify.notify_one();
    }

    /// The next `count` reads fail as if the connection dropped.
    pub fn fail_next_reads(&self, count: u32) {
        self.shared.failing_reads.store(count, Ordering::SeqCst);
    }

    /// The next `count` acknowledgments fail as if the connection dropped.
    /// The unsettled message goes back to the head of the queue.
    pub fn fail_next_acks(&self, count: u32) {
        self.shared.failing_acks.store(count, Ordering::SeqCst);
    }

    pub fn is_declared(&self) -> bool {
        self.shared.state.lock().map(|s| s.declared).unwrap_or(false)
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        self.shared.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Number of deliveries handed to a consumer, redeliveries included.
    pub fn delivered(&self) -> u64 {
        self.shared.state.lock().map(|s| s.delivered).unwrap_or(0)
    }

    pub fn requeued(&self) -> u64 {
        self.shared.state.lock().map(|s| s.requeued).unwrap_or(0)
    }

    pub fn acked(&self) -> Vec<Delivery> {
        self.shared
            .state
            .lock()
            .map(|s| s.acked.clone())
            .unwrap_or_default()
    }

    pub fn rejected(&self) -> Vec<(Delivery, String)> {
        self.shared
            .state
            .lock()
            .map(|s| s.rejected.clone())
            .unwrap_or_default()
    }

    /// Move the unsettled delivery back to the head of the queue.
    fn return_unsettled(state: &mut QueueState) {
        if let Some(mut delivery) = state.unsettled.take() {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
        }
    }

    fn settle(state: &mut QueueState, delivery: &Delivery) -> Result<Delivery, QueueError> {
        match state.unsettled.take() {
            Some(current) if current.delivery_id == delivery.delivery_id => Ok(current),
            other => {
                state.unsettled = other;
                Err(QueueError::command(
                    "settle",
                    format!("unknown delivery {}", delivery.delivery_id),
                ))
            }
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn declare(&mut self) -> Result<(), QueueError> {
        self.state()?.declared = true;
        Ok(())
    }

    async fn next(&mut self) -> Result<Next, QueueError> {
        loop {
            {
                let mut state = self.state()?;
                if !state.declared {
                    return Err(QueueError::command("next", "queue not declared"));
                }
                if take_failure(&self.shared.failing_reads) {
                    Self::return_unsettled(&mut state);
                    return Err(QueueError::connection_lost("next", "injected failure"));
                }
                if let Some(delivery) = state.ready.pop_front() {
                    state.delivered += 1;
                    state.unsettled = Some(delivery.clone());
                    return Ok(Next::Delivery(delivery));
                }
                if state.cancelled {
                    return Ok(Next::Cancelled);
                }
            }

            if tokio::time::timeout(self.block, self.shared.notify.notified())
                .await
                .is_err()
            {
                return Ok(Next::Idle);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        {
            let mut state = self.state()?;
            if take_failure(&self.shared.failing_acks) {
                Self::return_unsettled(&mut state);
                return Err(QueueError::connection_lost("ack", "injected failure"));
            }
            let settled = Self::settle(&mut state, delivery)?;
            state.acked.push(settled);
        }
        self.journal(JournalEntry::Acked(delivery.message_id.clone()));
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        {
            let mut state = self.state()?;
            let mut settled = Self::settle(&mut state, delivery)?;
            settled.redelivered = true;
            state.requeued += 1;
            state.ready.push_front(settled);
        }
        self.journal(JournalEntry::Requeued(delivery.message_id.clone()));
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        {
            let mut state = self.state()?;
            let settled = Self::settle(&mut state, delivery)?;
            state.rejected.push((settled, reason.to_string()));
        }
        self.journal(JournalEntry::Rejected(delivery.message_id.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            Self::return_unsettled(&mut state);
        }
    }
}
