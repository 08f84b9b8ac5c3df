//! Ordered, retried connection setup.
//!
//! Startup runs storage connection, then schema preparation, then queue
//! connection plus declaration. Each stage is retried under the same
//! [`RetryPolicy`] and only transient errors are retried.

use async_trait::async_trait;
use tracing::{info, instrument};

use paymentjob_core::{RetryPolicy, retry::retry};

use crate::config::{QueueSettings, StorageSettings, WorkerConfig};
use crate::queue::{MessageQueue, QueueError, RedisStreamQueue};
use crate::storage::{PostgresRecordStore, RecordStore, StorageError};

/// Opens connections to the backing services.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_storage(&self) -> Result<Box<dyn RecordStore>, StorageError>;

    async fn connect_queue(&self) -> Result<Box<dyn MessageQueue>, QueueError>;
}

/// Connects to PostgreSQL and Redis.
#[derive(Debug, Clone)]
pub struct ServiceConnector {
    queue: QueueSettings,
    storage: StorageSettings,
}

impl ServiceConnector {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            storage: config.storage.clone(),
        }
    }
}

#[async_trait]
impl Connector for ServiceConnector {
    async fn connect_storage(&self) -> Result<Box<dyn RecordStore>, StorageError> {
        let store = PostgresRecordStore::connect(&self.storage).await?;
        Ok(Box::new(store))
    }

    async fn connect_queue(&self) -> Result<Box<dyn MessageQueue>, QueueError> {
        let queue = RedisStreamQueue::connect(&self.queue).await?;
        Ok(Box::new(queue))
    }
}

pub struct ConnectionManager<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    #[instrument(skip(self), err)]
    pub async fn connect_storage(&self) -> Result<Box<dyn RecordStore>, StorageError> {
        let store = retry(&self.policy, "connect_storage", move |attempt| {
            info!(attempt, max_attempts = self.policy.max_attempts, "connecting to storage");
            self.connector.connect_storage()
        })
        .await?;
        info!("storage connected");
        Ok(store)
    }

    #[instrument(skip(self, store), err)]
    pub async fn prepare_schema(&self, store: &dyn RecordStore) -> Result<(), StorageError> {
        retry(&self.policy, "prepare_schema", move |_| store.prepare_schema()).await?;
        info!("schema prepared");
        Ok(())
    }

    /// Connect and declare the durable queue. Also used to recover from a
    /// lost connection mid-run.
    #[instrument(skip(self), err)]
    pub async fn connect_queue(&self) -> Result<Box<dyn MessageQueue>, QueueError> {
        let queue = retry(&self.policy, "connect_queue", move |attempt| async move {
            info!(attempt, max_attempts = self.policy.max_attempts, "connecting to queue");
            let mut queue = self.connector.connect_queue().await?;
            queue.declare().await?;
            Ok(queue)
        })
        .await?;
        info!("queue connected and declared");
        Ok(queue)
    }
}
