//! Routes watch events to handlers.
//!
//! The dispatch table is keyed by [`EventKind`]. Upserts and resyncs spawn a
//! serialized reconcile; deletes only release the key.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::key::ObjectKey;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::serializer::KeyedSerializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// Periodic re-dispatch of a known resource.
    Resync,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Resync => "resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: ObjectKey,
}

impl WatchEvent {
    pub fn new(kind: EventKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }
}

/// Handles one event, returning the spawned task if it started one.
pub type Handler = fn(&Dispatcher, WatchEvent) -> Option<JoinHandle<()>>;

pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    serializer: Arc<KeyedSerializer>,
    handlers: HashMap<EventKind, Handler>,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let mut dispatcher = Self {
            reconciler,
            serializer: Arc::new(KeyedSerializer::new()),
            handlers: HashMap::new(),
        };
        dispatcher.register(EventKind::Created, Self::on_upsert);
        dispatcher.register(EventKind::Updated, Self::on_upsert);
        dispatcher.register(EventKind::Resync, Self::on_upsert);
        dispatcher.register(EventKind::Deleted, Self::on_delete);
        dispatcher
    }

    /// Replace the handler for `kind`.
    pub fn register(&mut self, kind: EventKind, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    pub fn dispatch(&self, event: WatchEvent) -> Option<JoinHandle<()>> {
        let Some(handler) = self.handlers.get(&event.kind) else {
            debug!(kind = event.kind.as_str(), resource = %event.key, "no handler");
            return None;
        };
        handler(self, event)
    }

    /// Keys with a live serialization slot.
    pub fn tracked(&self) -> usize {
        self.serializer.tracked()
    }

    /// Dispatch until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<WatchEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        info!("event channel closed, dispatcher stopping");
    }

    fn on_upsert(&self, event: WatchEvent) -> Option<JoinHandle<()>> {
        let ticket = self.serializer.ticket(&event.key);
        let reconciler = Arc::clone(&self.reconciler);

        Some(tokio::spawn(async move {
            let key = event.key;
            let outcome = ticket.run(|| reconciler.reconcile(&key)).await;
            match outcome {
                None => debug!(resource = %key, "superseded by a newer event"),
                Some(Ok(ReconcileOutcome::Updated { phase })) => {
                    debug!(resource = %key, kind = event.kind.as_str(), %phase, "reconciled")
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    error!(resource = %key, kind = event.kind.as_str(), error = %err, "reconcile failed")
                }
            }
        }))
    }

    fn on_delete(&self, event: WatchEvent) -> Option<JoinHandle<()>> {
        info!(
            resource = %event.key,
            "resource deleted, its Job is garbage-collected through the owner reference"
        );
        self.serializer.release(&event.key);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use paymentjob_core::{
        PaymentJobSpec, Phase, QueueEndpoint, RetryPolicy, SecretReference, StorageEndpoint,
    };

    use crate::cluster::InMemoryCluster;

    fn spec() -> PaymentJobSpec {
        PaymentJobSpec {
            queue_name: "settlements".to_string(),
            image: "worker:1".to_string(),
            max_messages: None,
            queue: QueueEndpoint {
                host: "redis".to_string(),
                port: 6379,
                secret_ref: SecretReference {
                    name: "creds".to_string(),
                },
            },
            storage: StorageEndpoint {
                host: "postgres".to_string(),
                port: 5432,
                database: "ledger".to_string(),
                secret_ref: SecretReference {
                    name: "creds".to_string(),
                },
            },
        }
    }

    fn dispatcher(cluster: &Arc<InMemoryCluster>) -> Dispatcher {
        Dispatcher::new(Arc::new(Reconciler::new(
            cluster.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )))
    }

    #[tokio::test]
    async fn created_event_reconciles() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_secret("ns", "creds", &["username", "password"]);
        let key = cluster.apply("ns", "a", spec());

        let handle = dispatcher(&cluster)
            .dispatch(WatchEvent::new(EventKind::Created, key.clone()))
            .unwrap();
        handle.await.unwrap();

        assert_eq!(cluster.status(&key).unwrap().phase, Phase::Pending);
        assert_eq!(cluster.jobs().len(), 1);
    }

    #[tokio::test]
    async fn burst_for_one_key_creates_one_job() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_secret("ns", "creds", &["username", "password"]);
        let key = cluster.apply("ns", "a", spec());
        let dispatcher = dispatcher(&cluster);

        let handles: Vec<_> = [EventKind::Created, EventKind::Updated, EventKind::Resync]
            .into_iter()
            .filter_map(|kind| dispatcher.dispatch(WatchEvent::new(kind, key.clone())))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cluster.job_creations(), 1);
        assert_eq!(cluster.status_history(&key).len(), 1);
    }

    #[tokio::test]
    async fn delete_releases_the_key_without_reconciling() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_secret("ns", "creds", &["username", "password"]);
        let key = cluster.apply("ns", "a", spec());
        let dispatcher = dispatcher(&cluster);

        dispatcher
            .dispatch(WatchEvent::new(EventKind::Resync, key.clone()))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(dispatcher.tracked(), 1);

        cluster.delete(&key);
        assert!(
            dispatcher
                .dispatch(WatchEvent::new(EventKind::Deleted, key.clone()))
                .is_none()
        );
        assert_eq!(dispatcher.tracked(), 0);
        assert!(cluster.jobs().is_empty());
    }

    #[tokio::test]
    async fn unregistered_kind_is_ignored() {
        let cluster = Arc::new(InMemoryCluster::new());
        let mut dispatcher = dispatcher(&cluster);
        dispatcher.handlers.remove(&EventKind::Resync);

        let event = WatchEvent::new(EventKind::Resync, ObjectKey::new("ns", "a"));
        assert!(dispatcher.dispatch(event).is_none());
    }

    #[tokio::test]
    async fn run_drains_until_the_channel_closes() {
        let cluster = Arc::new(InMemoryCluster::new());
        let dispatcher = dispatcher(&cluster);
        let (tx, rx) = mpsc::channel(4);
        tx.send(WatchEvent::new(EventKind::Deleted, ObjectKey::new("ns", "a")))
            .await
            .unwrap();
        drop(tx);

        dispatcher.run(rx).await;
    }
}
