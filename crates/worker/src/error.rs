//! Worker-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Fatal worker failure. Any of these ends the process with a non-zero exit code.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
