use thiserror::Error;

use paymentjob_core::Transient;

use crate::cluster::ClusterError;
use crate::key::ObjectKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The stored object lacks metadata needed to own a Job.
    #[error("resource {key} has no metadata.{field}")]
    MissingMetadata {
        key: ObjectKey,
        field: &'static str,
    },
}

/// Only optimistic-concurrency conflicts are retried inside one reconcile.
/// Every other failure waits for the next event or resync.
impl Transient for ReconcileError {
    fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Cluster(ClusterError::Conflict(_)))
    }
}
