//! Payment worker: drains one durable queue into the `payments` table.
//!
//! Startup is strictly ordered (storage, schema, queue) and consumption is
//! one message at a time, so a record is always committed before its message
//! is acknowledged.

pub mod config;
pub mod connection;
pub mod error;
pub mod journal;
pub mod processor;
pub mod queue;
pub mod run_loop;
pub mod storage;

pub use config::{ConfigError, WorkerConfig};
pub use connection::{ConnectionManager, Connector, ServiceConnector};
pub use error::WorkerError;
pub use processor::{MessageProcessor, Outcome};
pub use queue::{Delivery, MessageQueue, Next, QueueError};
pub use run_loop::{ExitReason, RunLoop, RunSettings, RunSummary, WorkerState};
pub use storage::{NewRecord, RecordStore, StorageError};
