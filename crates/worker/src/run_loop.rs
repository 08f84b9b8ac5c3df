//! The worker state machine.
//!
//! `Connecting → Migrating → Consuming → Exited`. Only `Consuming` loops; at
//! most one message is unsettled at any time and the next one is requested
//! only after the previous one has been acknowledged, requeued or rejected.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use paymentjob_core::Transient;

use crate::config::WorkerConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::error::WorkerError;
use crate::processor::{MessageProcessor, Outcome};
use crate::queue::{MessageQueue, Next};
use crate::storage::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Migrating,
    Consuming,
    Exited,
}

/// Why a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    BoundReached,
    /// The broker reported that no further messages will arrive.
    QueueCancelled,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub source_queue: String,
    pub max_messages: Option<u64>,
    /// Pause after a requeue before asking for the next message.
    pub redelivery_delay: Duration,
}

impl RunSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            source_queue: config.queue.name.clone(),
            max_messages: config.max_messages,
            redelivery_delay: config.redelivery_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Messages counted toward the bound (persisted plus rejected).
    pub processed: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub reason: ExitReason,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    persisted: u64,
    rejected: u64,
    requeued: u64,
}

impl Tally {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Persisted { .. } => self.persisted += 1,
            Outcome::Poisoned => self.rejected += 1,
            Outcome::Requeued => self.requeued += 1,
        }
    }

    fn processed(&self) -> u64 {
        self.persisted + self.rejected
    }
}

pub struct RunLoop<C> {
    connections: ConnectionManager<C>,
    processor: MessageProcessor,
    settings: RunSettings,
    state: watch::Sender<WorkerState>,
    tally: Tally,
}

impl<C: Connector> RunLoop<C> {
    pub fn new(connections: ConnectionManager<C>, settings: RunSettings) -> Self {
        let (state, _) = watch::channel(WorkerState::Connecting);
        Self {
            connections,
            processor: MessageProcessor::new(settings.source_queue.clone()),
            settings,
            state,
            tally: Tally::default(),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn enter(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "worker state changed");
        }
    }

    /// Run to completion. `shutdown` resolving stops the loop at the next
    /// point where no message is in flight.
    pub async fn run<S>(mut self, shutdown: S) -> Result<RunSummary, WorkerError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let startup = async {
            self.enter(WorkerState::Connecting);
            let store = self.connections.connect_storage().await?;
            self.enter(WorkerState::Migrating);
            self.connections.prepare_schema(store.as_ref()).await?;
            let queue = self.connections.connect_queue().await?;
            Ok::<_, WorkerError>((store, queue))
        };

        let connected = tokio::select! {
            biased;
            () = shutdown.as_mut() => None,
            connected = startup => Some(connected),
        };
        let (store, mut queue) = match connected {
            Some(Ok(connections)) => connections,
            Some(Err(err)) => {
                self.enter(WorkerState::Exited);
                return Err(err);
            }
            None => {
                info!("shutdown requested during startup");
                self.enter(WorkerState::Exited);
                return Ok(self.summary(ExitReason::Shutdown));
            }
        };

        self.enter(WorkerState::Consuming);
        let result = self
            .consume(store.as_ref(), &mut queue, shutdown.as_mut())
            .await;

        queue.close().await;
        store.close().await;
        self.enter(WorkerState::Exited);

        let reason = result?;
        let summary = self.summary(reason);
        info!(
            processed = summary.processed,
            persisted = summary.persisted,
            rejected = summary.rejected,
            requeued = summary.requeued,
            reason = ?summary.reason,
            "worker finished"
        );
        Ok(summary)
    }

    async fn consume<S>(
        &mut self,
        store: &dyn RecordStore,
        queue: &mut Box<dyn MessageQueue>,
        mut shutdown: Pin<&mut S>,
    ) -> Result<ExitReason, WorkerError>
    where
        S: Future<Output = ()>,
    {
        loop {
            if let Some(bound) = self.settings.max_messages {
                if self.tally.processed() >= bound {
                    info!(bound, "message bound reached");
                    return Ok(ExitReason::BoundReached);
                }
            }

            let next = tokio::select! {
                biased;
                () = shutdown.as_mut() => {
                    info!("shutdown requested");
                    return Ok(ExitReason::Shutdown);
                }
                next = queue.next() => next,
            };

            let delivery = match next {
                Ok(Next::Delivery(delivery)) => delivery,
                Ok(Next::Idle) => {
                    debug!("no messages available");
                    continue;
                }
                Ok(Next::Cancelled) => {
                    info!("consumer cancelled by the broker, queue drained");
                    return Ok(ExitReason::QueueCancelled);
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "queue connection lost, reconnecting");
                    *queue = self.connections.connect_queue().await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            // An in-flight message is always settled before a shutdown is honored.
            match self.processor.process(&delivery, store, queue.as_mut()).await {
                Ok(outcome) => {
                    self.tally.record(outcome);
                    if outcome == Outcome::Requeued {
                        tokio::select! {
                            biased;
                            () = shutdown.as_mut() => {
                                info!("shutdown requested");
                                return Ok(ExitReason::Shutdown);
                            }
                            () = tokio::time::sleep(self.settings.redelivery_delay) => {}
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        error = %err,
                        delivery_id = %delivery.delivery_id,
                        "settlement lost with the connection, message will be redelivered"
                    );
                    *queue = self.connections.connect_queue().await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn summary(&self, reason: ExitReason) -> RunSummary {
        RunSummary {
            processed: self.tally.processed(),
            persisted: self.tally.persisted,
            rejected: self.tally.rejected,
            requeued: self.tally.requeued,
            reason,
        }
    }
}
