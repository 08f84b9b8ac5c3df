//! Durable record storage.
//!
//! `insert` returns only after the record's transaction has committed; the
//! caller acknowledges the message strictly afterwards.

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryRecordStore, StoredRecord};
pub use postgres::PostgresRecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use paymentjob_core::Transient;

/// Name of the table every worker writes to.
pub const PAYMENTS_TABLE: &str = "payments";

/// One row to be appended to `payments`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub received_at: DateTime<Utc>,
    pub payload: JsonValue,
    /// Publisher-assigned message identifier, if the message carried one.
    pub message_id: Option<String>,
    pub source_queue: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connection-level failure; retrying later may succeed.
    #[error("storage unavailable during {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    /// The database refused the statement.
    #[error("storage rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl StorageError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            message: message.into(),
        }
    }

    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            message: message.into(),
        }
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the table and its indexes if absent. Idempotent.
    async fn prepare_schema(&self) -> Result<(), StorageError>;

    /// Insert one record in its own transaction and commit it.
    ///
    /// Returns the generated row id.
    async fn insert(&self, record: &NewRecord) -> Result<i64, StorageError>;

    async fn close(&self);
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    async fn prepare_schema(&self) -> Result<(), StorageError> {
        (**self).prepare_schema().await
    }

    async fn insert(&self, record: &NewRecord) -> Result<i64, StorageError> {
        (**self).insert(record).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
