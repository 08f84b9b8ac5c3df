//! Durable message queue seam.
//!
//! One delivery is outstanding at a time. Every delivery ends in exactly one
//! of `ack`, `nack` or `reject`.

mod in_memory;
mod redis_streams;

pub use in_memory::InMemoryQueue;
pub use redis_streams::RedisStreamQueue;

use async_trait::async_trait;
use thiserror::Error;

use paymentjob_core::Transient;

/// A message received from the queue and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id used to settle this delivery.
    pub delivery_id: String,
    /// Publisher-assigned message id, if present.
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    /// The broker has handed this message out before.
    pub redelivered: bool,
}

/// Result of waiting for the next message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Delivery(Delivery),
    /// Nothing arrived within the read timeout.
    Idle,
    /// The broker cancelled the consumer (queue deleted). No more deliveries.
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue connection lost during {operation}: {message}")]
    ConnectionLost {
        operation: &'static str,
        message: String,
    },

    #[error("queue command {operation} failed: {message}")]
    Command {
        operation: &'static str,
        message: String,
    },
}

impl QueueError {
    pub fn connection_lost(operation: &'static str, message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            operation,
            message: message.into(),
        }
    }

    pub fn command(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            operation,
            message: message.into(),
        }
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, QueueError::ConnectionLost { .. })
    }
}

#[async_trait]
pub trait MessageQueue: Send {
    /// Ensure the durable queue exists. Idempotent.
    async fn declare(&mut self) -> Result<(), QueueError>;

    /// Wait for the next delivery, up to the configured read timeout.
    async fn next(&mut self) -> Result<Next, QueueError>;

    /// Settle positively; the message will not be delivered again.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle negatively and keep the message for redelivery.
    async fn nack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle negatively without redelivery.
    async fn reject(&mut self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    async fn close(&mut self);
}
