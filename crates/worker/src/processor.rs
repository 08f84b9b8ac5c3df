//! Per-message policy: decode, persist, then settle.

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use crate::queue::{Delivery, MessageQueue, QueueError};
use crate::storage::{NewRecord, RecordStore};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Record committed, then the message acknowledged.
    Persisted { record_id: i64 },
    /// Body was not valid JSON; rejected without redelivery.
    Poisoned,
    /// The write failed; the message was returned for redelivery.
    Requeued,
}

impl Outcome {
    /// Whether this outcome advances the message bound.
    pub fn counts_toward_bound(self) -> bool {
        matches!(self, Outcome::Persisted { .. } | Outcome::Poisoned)
    }
}

#[derive(Debug, Clone)]
pub struct MessageProcessor {
    source_queue: String,
}

impl MessageProcessor {
    pub fn new(source_queue: impl Into<String>) -> Self {
        Self {
            source_queue: source_queue.into(),
        }
    }

    /// Settle one delivery. Only queue failures are returned; storage
    /// failures become [`Outcome::Requeued`].
    #[instrument(
        skip(self, delivery, store, queue),
        fields(
            delivery_id = %delivery.delivery_id,
            message_id = delivery.message_id.as_deref().unwrap_or("none"),
            redelivered = delivery.redelivered
        )
    )]
    pub async fn process(
        &self,
        delivery: &Delivery,
        store: &dyn RecordStore,
        queue: &mut dyn MessageQueue,
    ) -> Result<Outcome, QueueError> {
        let payload = match serde_json::from_slice::<JsonValue>(&delivery.body) {
            Ok(payload) => payload,
            Err(err) => {
                let reason = format!("malformed payload: {err}");
                warn!(error = %err, bytes = delivery.body.len(), "rejecting malformed message");
                queue.reject(delivery, &reason).await?;
                return Ok(Outcome::Poisoned);
            }
        };

        let record = NewRecord {
            received_at: Utc::now(),
            payload,
            message_id: delivery.message_id.clone(),
            source_queue: self.source_queue.clone(),
        };

        match store.insert(&record).await {
            Ok(record_id) => {
                queue.ack(delivery).await?;
                info!(record_id, "payment persisted");
                Ok(Outcome::Persisted { record_id })
            }
            Err(err) => {
                warn!(error = %err, "persist failed, requesting redelivery");
                queue.nack(delivery).await?;
                Ok(Outcome::Requeued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Journal, JournalEntry};
    use crate::queue::{InMemoryQueue, Next};
    use crate::storage::InMemoryRecordStore;

    async fn setup(journal: &Journal) -> (InMemoryRecordStore, InMemoryQueue) {
        let store = InMemoryRecordStore::new().with_journal(journal.clone());
        store.prepare_schema().await.unwrap();
        let mut queue = InMemoryQueue::with_journal(journal.clone());
        queue.declare().await.unwrap();
        (store, queue)
    }

    async fn receive(queue: &mut InMemoryQueue) -> Delivery {
        match queue.next().await.unwrap() {
            Next::Delivery(delivery) => delivery,
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_message_is_committed_before_ack() {
        let journal = Journal::new();
        let (store, mut queue) = setup(&journal).await;
        queue.publish(r#"{"amount": 12.5, "currency": "EUR"}"#, Some("m-1"));

        let delivery = receive(&mut queue).await;
        let outcome = MessageProcessor::new("payments")
            .process(&delivery, &store, &mut queue)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Persisted { record_id: 1 });
        assert_eq!(
            journal.entries(),
            vec![
                JournalEntry::Committed(Some("m-1".to_string())),
                JournalEntry::Acked(Some("m-1".to_string())),
            ]
        );
        let stored = &store.records()[0].record;
        assert_eq!(stored.source_queue, "payments");
        assert_eq!(stored.payload["currency"], "EUR");
    }

    #[tokio::test]
    async fn malformed_message_is_rejected_without_a_record() {
        let journal = Journal::new();
        let (store, mut queue) = setup(&journal).await;
        queue.publish("{not json", Some("bad"));

        let delivery = receive(&mut queue).await;
        let outcome = MessageProcessor::new("payments")
            .process(&delivery, &store, &mut queue)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Poisoned);
        assert!(outcome.counts_toward_bound());
        assert!(store.is_empty());
        assert_eq!(queue.rejected().len(), 1);
        assert!(queue.rejected()[0].1.starts_with("malformed payload"));
    }

    #[tokio::test]
    async fn storage_failure_requeues_and_does_not_count() {
        let journal = Journal::new();
        let (store, mut queue) = setup(&journal).await;
        store.fail_next_inserts(1);
        queue.publish(r#"{"amount": 1}"#, Some("m-1"));

        let delivery = receive(&mut queue).await;
        let outcome = MessageProcessor::new("payments")
            .process(&delivery, &store, &mut queue)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Requeued);
        assert!(!outcome.counts_toward_bound());
        assert_eq!(
            journal.entries(),
            vec![JournalEntry::Requeued(Some("m-1".to_string()))]
        );
        assert_eq!(queue.ready_len(), 1);
    }

    #[tokio::test]
    async fn message_without_id_is_still_persisted() {
        let journal = Journal::new();
        let (store, mut queue) = setup(&journal).await;
        queue.publish("[1, 2, 3]", None);

        let delivery = receive(&mut queue).await;
        MessageProcessor::new("payments")
            .process(&delivery, &store, &mut queue)
            .await
            .unwrap();

        assert_eq!(store.records()[0].record.message_id, None);
    }
}
