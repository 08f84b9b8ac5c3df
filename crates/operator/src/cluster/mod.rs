//! The operator's view of the Kubernetes API.
//!
//! The reconciler talks only to [`ClusterApi`]. [`KubeCluster`] implements it
//! against a real API server and [`InMemoryCluster`] backs the tests.

mod in_memory;
mod kubernetes;

pub use in_memory::{InMemoryCluster, RecordedEvent};
pub use kubernetes::KubeCluster;

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use thiserror::Error;

use paymentjob_core::{PaymentJob, PaymentJobStatus, Transient};

use crate::key::ObjectKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// A write carried a stale `resourceVersion`.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The API server refused the request and repeating it will not help.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// Transport failure, throttling or a server-side error.
    #[error("API server unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode request: {0}")]
    Serialization(String),
}

impl Transient for ClusterError {
    fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::Unavailable(_))
    }
}

/// Result of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl EventSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Normal => "Normal",
            EventSeverity::Warning => "Warning",
        }
    }
}

/// A Kubernetes Event to attach to a `PaymentJob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub severity: EventSeverity,
    pub reason: &'static str,
    pub note: String,
}

impl ResourceEvent {
    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason,
            note: note.into(),
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_resource(&self, key: &ObjectKey) -> Result<Option<PaymentJob>, ClusterError>;

    /// Data keys of a Secret, or `None` if the Secret does not exist.
    async fn secret_keys(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeSet<String>>, ClusterError>;

    async fn create_job(&self, job: &Job) -> Result<CreateOutcome, ClusterError>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError>;

    /// Replace the status subresource.
    ///
    /// With `resource_version` set the write is conditional and a stale
    /// version fails with [`ClusterError::Conflict`].
    async fn patch_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &PaymentJobStatus,
    ) -> Result<(), ClusterError>;

    async fn publish_event(
        &self,
        resource: &PaymentJob,
        event: &ResourceEvent,
    ) -> Result<(), ClusterError>;
}
