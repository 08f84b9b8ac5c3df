//! PostgreSQL record store (sqlx).
//!
//! Error mapping:
//!
//! | SQLx error | SQLSTATE class | `StorageError` |
//! |------------|----------------|----------------|
//! | Database | 08, 53, 57P, 40001 | `Unavailable` |
//! | Database | anything else | `Rejected` |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | n/a | `Unavailable` |
//! | other | n/a | `Rejected` |

use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, instrument};

use super::{NewRecord, RecordStore, StorageError};
use crate::config::StorageSettings;

const SCHEMA_STATEMENTS: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS payments (
        id BIGSERIAL PRIMARY KEY,
        received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        payload JSONB NOT NULL,
        message_id TEXT NULL,
        source_queue TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_payments_received_at ON payments (received_at)",
    "CREATE INDEX IF NOT EXISTS idx_payments_message_id ON payments (message_id)",
];

const INSERT_RECORD: &str = r#"
    INSERT INTO payments (received_at, payload, message_id, source_queue)
    VALUES ($1, $2, $3, $4)
    RETURNING id
"#;

/// Store backed by a single pooled connection; the worker never issues
/// concurrent statements.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &StorageSettings) -> Result<Self, StorageError> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .database(&settings.database)
            .username(&settings.credentials.username)
            .password(&settings.credentials.password)
            .application_name("paymentjob-worker");

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self), err)]
    async fn prepare_schema(&self) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_schema", e))?;

        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("prepare_schema", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_schema", e))?;

        debug!("payments schema ready");
        Ok(())
    }

    #[instrument(
        skip(self, record),
        fields(message_id = record.message_id.as_deref().unwrap_or("none")),
        err
    )]
    async fn insert(&self, record: &NewRecord) -> Result<i64, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_insert", e))?;

        let row = sqlx::query(INSERT_RECORD)
            .bind(record.received_at)
            .bind(&record.payload)
            .bind(record.message_id.as_deref())
            .bind(&record.source_queue)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_record", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("insert_record", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_insert", e))?;

        Ok(id)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code() {
                Some(code) if is_transient_sqlstate(code.as_ref()) => {
                    StorageError::unavailable(operation, message)
                }
                _ => StorageError::rejected(operation, message),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::unavailable(operation, err.to_string()),
        _ => StorageError::rejected(operation, err.to_string()),
    }
}

/// Connection exceptions, resource exhaustion, operator intervention and
/// serialization failures.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("53") || code.starts_with("57P") || code == "40001"
}
