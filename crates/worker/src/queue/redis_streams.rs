//! Redis Streams queue.
//!
//! - **Queue**: one stream key; declared with `XGROUP CREATE ... MKSTREAM`
//! - **Consumer group**: `paymentjob-workers`, shared by every worker on the stream
//! - **Consumer**: one per pod, so its pending entries survive a reconnect
//! - **Dead-letter**: optional stream receiving rejected entries
//!
//! Reads go in this order: this consumer's own pending entries (`0`), then
//! entries abandoned by other consumers (`XPENDING` + `XCLAIM`), then new
//! entries (`>`, blocking).
//!
//! Entry fields: `body` (JSON payload) and optional `message_id`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError};
use tracing::{debug, info, warn};

use super::{Delivery, MessageQueue, Next, QueueError};
use crate::config::QueueSettings;

pub const CONSUMER_GROUP: &str = "paymentjob-workers";

const BODY_FIELD: &str = "body";
const MESSAGE_ID_FIELD: &str = "message_id";

/// Entries idle longer than this under another consumer are claimed.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);
const PENDING_SCAN: usize = 10;

pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    stream: String,
    consumer: String,
    dead_letter: Option<String>,
    block: Duration,
    claim_idle: Duration,
}

impl RedisStreamQueue {
    pub async fn connect(settings: &QueueSettings) -> Result<Self, QueueError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(settings.host.clone(), settings.port),
            redis: RedisConnectionInfo {
                username: Some(settings.credentials.username.clone()),
                password: Some(settings.credentials.password.clone()),
                ..Default::default()
            },
        };

        let client =
            redis::Client::open(info).map_err(|e| map_redis_error("open_client", e))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;

        Ok(Self {
            conn,
            stream: settings.name.clone(),
            consumer: settings.consumer.clone(),
            dead_letter: settings.dead_letter.clone(),
            block: settings.block,
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    /// Read one entry with the given start id. `None` means nothing to read.
    async fn read_one(&mut self, start: &str, block: bool) -> Result<Option<Next>, QueueError> {
        let mut options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer)
            .count(1);
        if block {
            options = options.block(self.block.as_millis() as usize);
        }

        let reply: Result<Option<StreamReadReply>, RedisError> = self
            .conn
            .xread_options(&[&self.stream], &[start], &options)
            .await;

        match reply {
            Ok(reply) => Ok(reply
                .and_then(|r| r.keys.into_iter().next())
                .and_then(|key| key.ids.into_iter().next())
                .map(|entry| Next::Delivery(to_delivery(entry, start != ">")))),
            Err(e) => cancelled_or_error("XREADGROUP", e),
        }
    }

    /// Claim one entry left pending by another consumer for too long.
    async fn claim_abandoned(&mut self) -> Result<Option<Next>, QueueError> {
        let pending: Result<StreamPendingCountReply, RedisError> = self
            .conn
            .xpending_count(&self.stream, CONSUMER_GROUP, "-", "+", PENDING_SCAN)
            .await;
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) => return cancelled_or_error("XPENDING", e),
        };

        let idle_ms = self.claim_idle.as_millis() as usize;
        let Some(stale) = pending
            .ids
            .iter()
            .find(|p| p.consumer != self.consumer && p.last_delivered_ms >= idle_ms)
        else {
            return Ok(None);
        };

        let claimed: Result<StreamClaimReply, RedisError> = self
            .conn
            .xclaim(
                &self.stream,
                CONSUMER_GROUP,
                &self.consumer,
                idle_ms,
                &[&stale.id],
            )
            .await;
        let claimed = match claimed {
            Ok(claimed) => claimed,
            Err(e) => return cancelled_or_error("XCLAIM", e),
        };

        Ok(claimed.ids.into_iter().next().map(|entry| {
            info!(
                entry_id = %entry.id,
                previous_consumer = %stale.consumer,
                "claimed abandoned delivery"
            );
            Next::Delivery(to_delivery(entry, true))
        }))
    }
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    async fn declare(&mut self) -> Result<(), QueueError> {
        let created: Result<(), RedisError> = self
            .conn
            .xgroup_create_mkstream(&self.stream, CONSUMER_GROUP, "0")
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = CONSUMER_GROUP, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream, group = CONSUMER_GROUP, "consumer group exists");
                Ok(())
            }
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    async fn next(&mut self) -> Result<Next, QueueError> {
        if let Some(next) = self.read_one("0", false).await? {
            return Ok(next);
        }
        if let Some(next) = self.claim_abandoned().await? {
            return Ok(next);
        }
        Ok(self.read_one(">", true).await?.unwrap_or(Next::Idle))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        let _: i64 = self
            .conn
            .xack(&self.stream, CONSUMER_GROUP, &[&delivery.delivery_id])
            .await
            .map_err(|e| map_redis_error("XACK", e))?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        // The entry stays in this consumer's pending list and is read again
        // through the `0` cursor.
        debug!(entry_id = %delivery.delivery_id, "delivery left pending for redelivery");
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        if let Some(dead_letter) = &self.dead_letter {
            let rejected_at = chrono::Utc::now().to_rfc3339();
            let mut fields: Vec<(&str, &[u8])> = vec![
                (BODY_FIELD, delivery.body.as_slice()),
                ("source_queue", self.stream.as_bytes()),
                ("original_entry_id", delivery.delivery_id.as_bytes()),
                ("reason", reason.as_bytes()),
                ("rejected_at", rejected_at.as_bytes()),
            ];
            if let Some(message_id) = &delivery.message_id {
                fields.push((MESSAGE_ID_FIELD, message_id.as_bytes()));
            }

            let _: String = self
                .conn
                .xadd(dead_letter, "*", fields.as_slice())
                .await
                .map_err(|e| map_redis_error("XADD dead-letter", e))?;
            warn!(
                entry_id = %delivery.delivery_id,
                dead_letter = %dead_letter,
                "message routed to dead-letter stream"
            );
        }

        self.ack(delivery).await
    }

    async fn close(&mut self) {
        debug!(stream = %self.stream, consumer = %self.consumer, "queue connection released");
    }
}

fn to_delivery(entry: StreamId, redelivered: bool) -> Delivery {
    Delivery {
        message_id: entry.get::<String>(MESSAGE_ID_FIELD),
        body: entry.get::<Vec<u8>>(BODY_FIELD).unwrap_or_default(),
        delivery_id: entry.id,
        redelivered,
    }
}

/// The group or stream was removed underneath the consumer.
fn is_no_group(err: &RedisError) -> bool {
    err.code() == Some("NOGROUP")
}

/// `NOGROUP` on any read-side command ends consumption cleanly.
fn cancelled_or_error(
    operation: &'static str,
    err: RedisError,
) -> Result<Option<Next>, QueueError> {
    if is_no_group(&err) {
        info!(operation, "consumer group is gone, consumption cancelled");
        return Ok(Some(Next::Cancelled));
    }
    Err(map_redis_error(operation, err))
}

fn map_redis_error(operation: &'static str, err: RedisError) -> QueueError {
    if err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
    {
        QueueError::connection_lost(operation, err.to_string())
    } else {
        QueueError::command(operation, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{ErrorKind, Value};
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1700000000000-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Data(v.as_bytes().to_vec())))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn entry_fields_become_a_delivery() {
        let delivery = to_delivery(
            entry(&[("body", r#"{"amount":5}"#), ("message_id", "m-1")]),
            false,
        );
        assert_eq!(delivery.delivery_id, "1700000000000-0");
        assert_eq!(delivery.message_id.as_deref(), Some("m-1"));
        assert_eq!(delivery.body, br#"{"amount":5}"#.to_vec());
        assert!(!delivery.redelivered);
    }

    #[test]
    fn entry_without_body_yields_empty_payload() {
        let delivery = to_delivery(entry(&[("other", "x")]), true);
        assert!(delivery.body.is_empty());
        assert_eq!(delivery.message_id, None);
        assert!(delivery.redelivered);
    }

    #[test]
    fn io_errors_are_connection_losses() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = map_redis_error("XREADGROUP", RedisError::from(io));
        assert!(matches!(err, QueueError::ConnectionLost { .. }));
    }

    #[test]
    fn server_errors_are_command_failures() {
        let err = map_redis_error(
            "XACK",
            RedisError::from((ErrorKind::ResponseError, "WRONGTYPE")),
        );
        assert!(matches!(err, QueueError::Command { operation: "XACK", .. }));
    }

    #[test]
    fn missing_group_during_claim_cancels_consumption() {
        let gone = redis::parse_redis_value(
            b"-NOGROUP No such key 'payments' or consumer group 'workers'\r\n",
        )
        .unwrap_err();
        assert_eq!(gone.code(), Some("NOGROUP"));
        assert_eq!(
            cancelled_or_error("XCLAIM", gone).unwrap(),
            Some(Next::Cancelled)
        );
    }

    #[test]
    fn other_claim_failures_stay_errors() {
        let err = cancelled_or_error(
            "XCLAIM",
            RedisError::from((ErrorKind::ResponseError, "WRONGTYPE")),
        );
        assert!(matches!(
            err,
            Err(QueueError::Command { operation: "XCLAIM", .. })
        ));
    }
}
