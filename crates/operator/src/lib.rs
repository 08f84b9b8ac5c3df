//! PaymentJob operator.
//!
//! Watches `PaymentJob` resources, creates one worker Job per resource and
//! mirrors the Job's progress into the resource status.
//!
//! ## Flow
//!
//! ```text
//! watcher ──WatchEvent──▶ Dispatcher ──(per-key serialized)──▶ Reconciler ──▶ ClusterApi
//!                                                                  │
//!                                                                  └─▶ projector (Job → Phase)
//! ```

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod key;
pub mod manifest;
pub mod projector;
pub mod reconciler;
pub mod serializer;
pub mod watcher;

pub use cluster::{ClusterApi, ClusterError, CreateOutcome, EventSeverity, ResourceEvent};
pub use config::{ConfigError, OperatorConfig};
pub use dispatch::{Dispatcher, EventKind, WatchEvent};
pub use error::ReconcileError;
pub use key::ObjectKey;
pub use reconciler::{ReconcileOutcome, Reconciler};
