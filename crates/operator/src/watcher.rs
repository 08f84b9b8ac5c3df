//! Turns the `PaymentJob` watch stream into [`WatchEvent`]s.
//!
//! Owns no reconcile logic. Tracks which keys exist so applies can be told
//! apart as creates or updates, so objects that vanished during a relist
//! are reported as deletes, and so the periodic resync knows what to send.

use std::collections::BTreeSet;
use std::pin::pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::{WatchStreamExt, watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use paymentjob_core::PaymentJob;

use crate::dispatch::{EventKind, WatchEvent};
use crate::key::ObjectKey;

#[derive(Debug, Default)]
pub struct EventTranslator {
    known: BTreeSet<ObjectKey>,
    relisting: Option<BTreeSet<ObjectKey>>,
}

impl EventTranslator {
    pub fn translate(&mut self, event: watcher::Event<PaymentJob>) -> Vec<WatchEvent> {
        match event {
            watcher::Event::Apply(resource) => self.applied(&resource).into_iter().collect(),
            watcher::Event::InitApply(resource) => {
                if let (Some(seen), Some(key)) =
                    (self.relisting.as_mut(), ObjectKey::from_resource(&resource))
                {
                    seen.insert(key);
                }
                self.applied(&resource).into_iter().collect()
            }
            watcher::Event::Delete(resource) => {
                let Some(key) = ObjectKey::from_resource(&resource) else {
                    return Vec::new();
                };
                self.known.remove(&key);
                vec![WatchEvent::new(EventKind::Deleted, key)]
            }
            watcher::Event::Init => {
                self.relisting = Some(BTreeSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                let gone: Vec<ObjectKey> = self.known.difference(&seen).cloned().collect();
                gone.into_iter()
                    .map(|key| {
                        self.known.remove(&key);
                        WatchEvent::new(EventKind::Deleted, key)
                    })
                    .collect()
            }
        }
    }

    fn applied(&mut self, resource: &PaymentJob) -> Option<WatchEvent> {
        let Some(key) = ObjectKey::from_resource(resource) else {
            debug!("ignoring object without a namespace");
            return None;
        };
        let kind = if self.known.insert(key.clone()) {
            EventKind::Created
        } else {
            EventKind::Updated
        };
        Some(WatchEvent::new(kind, key))
    }

    pub fn known(&self) -> impl Iterator<Item = &ObjectKey> {
        self.known.iter()
    }
}

/// Forward translated events to `tx`, plus a resync of every known key each
/// `resync` period. Returns when the stream ends or the receiver is dropped.
pub async fn pump<S>(stream: S, resync: Duration, tx: mpsc::Sender<WatchEvent>)
where
    S: Stream<Item = Result<watcher::Event<PaymentJob>, watcher::Error>>,
{
    let mut stream = pin!(stream);
    let mut translator = EventTranslator::default();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + resync, resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let batch = tokio::select! {
            item = stream.next() => match item {
                None => {
                    warn!("watch stream ended");
                    return;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "watch failed, backing off");
                    continue;
                }
                Some(Ok(event)) => translator.translate(event),
            },
            _ = ticker.tick() => translator
                .known()
                .map(|key| WatchEvent::new(EventKind::Resync, key.clone()))
                .collect::<Vec<_>>(),
        };

        for event in batch {
            if tx.send(event).await.is_err() {
                info!("dispatcher gone, watcher stopping");
                return;
            }
        }
    }
}

/// Watch `api` with backoff on errors and pump its events into `tx`.
pub async fn watch(api: Api<PaymentJob>, resync: Duration, tx: mpsc::Sender<WatchEvent>) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pump(stream, resync, tx).await
}
