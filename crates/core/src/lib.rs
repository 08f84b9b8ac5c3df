//! `paymentjob-core`: types shared by the operator and the worker.
//!
//! Holds the `PaymentJob` custom resource, the phase model, the retry policy
//! and the environment contract the operator injects into worker pods.

pub mod env;
pub mod error;
pub mod phase;
pub mod resource;
pub mod retry;
pub mod shutdown;

pub use error::ValidationError;
pub use phase::Phase;
pub use resource::{
    PaymentJob, PaymentJobSpec, PaymentJobStatus, QueueEndpoint, SecretReference,
    StorageEndpoint,
};
pub use retry::{BackoffStrategy, RetryPolicy, Transient};
