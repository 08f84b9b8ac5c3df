//! Spec validation errors.

use thiserror::Error;

/// Why a `PaymentJob` spec cannot be turned into a worker Job.
///
/// These are non-retryable: the reconciler reports them through
/// `status.phase = Failed` and `status.message`, and creates nothing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required string field is absent or blank.
    #[error("spec.{field} is required")]
    MissingField { field: &'static str },

    /// `maxMessages` was set to zero.
    #[error("spec.maxMessages must be a positive integer, got {0}")]
    InvalidBound(u64),

    /// A credential reference points at a Secret that does not exist.
    #[error("secret {namespace}/{name} referenced by spec.{field} does not exist")]
    MissingSecret {
        field: &'static str,
        namespace: String,
        name: String,
    },

    /// The referenced Secret exists but lacks a credential key.
    #[error("secret {namespace}/{name} referenced by spec.{field} has no '{key}' key")]
    MissingSecretKey {
        field: &'static str,
        namespace: String,
        name: String,
        key: &'static str,
    },
}

impl ValidationError {
    pub fn missing(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    /// Kubernetes Event reason for this failure.
    pub fn reason(&self) -> &'static str {
        "ValidationFailed"
    }
}
