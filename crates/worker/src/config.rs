//! Worker configuration, read from the environment the operator injects.

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use paymentjob_core::env;
use paymentjob_core::resource::{DEFAULT_QUEUE_PORT, DEFAULT_STORAGE_PORT};
use paymentjob_core::RetryPolicy;

pub const QUEUE_DEAD_LETTER: &str = "QUEUE_DEAD_LETTER";
pub const QUEUE_CONSUMER: &str = "QUEUE_CONSUMER";
pub const QUEUE_BLOCK_MS: &str = "QUEUE_BLOCK_MS";
pub const CONNECT_MAX_ATTEMPTS: &str = "CONNECT_MAX_ATTEMPTS";
pub const CONNECT_RETRY_DELAY_MS: &str = "CONNECT_RETRY_DELAY_MS";
pub const REDELIVERY_DELAY_MS: &str = "REDELIVERY_DELAY_MS";

const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_CONNECT_DELAY_MS: u64 = 5_000;
const DEFAULT_BLOCK_MS: u64 = 5_000;
const DEFAULT_REDELIVERY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Username/password pair. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Stream key of the durable queue.
    pub name: String,
    /// Stream receiving permanently rejected messages, if any.
    pub dead_letter: Option<String>,
    /// Consumer name inside the group; stable for the life of the pod.
    pub consumer: String,
    /// How long one read waits for new messages before reporting idle.
    pub block: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    /// `None` means run until the queue is drained or a signal arrives.
    pub max_messages: Option<u64>,
    pub connect_retry: RetryPolicy,
    pub redelivery_delay: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup: &lookup };

        let queue = QueueSettings {
            host: vars.required(env::QUEUE_HOST)?,
            port: vars.parsed(env::QUEUE_PORT)?.unwrap_or(DEFAULT_QUEUE_PORT),
            credentials: Credentials {
                username: vars.required(env::QUEUE_USER)?,
                password: vars.required(env::QUEUE_PASS)?,
            },
            name: vars.required(env::QUEUE_NAME)?,
            dead_letter: vars.optional(QUEUE_DEAD_LETTER),
            consumer: vars
                .optional(QUEUE_CONSUMER)
                .or_else(|| vars.optional("HOSTNAME"))
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7())),
            block: Duration::from_millis(vars.parsed(QUEUE_BLOCK_MS)?.unwrap_or(DEFAULT_BLOCK_MS)),
        };

        let storage = StorageSettings {
            host: vars.required(env::STORAGE_HOST)?,
            port: vars.parsed(env::STORAGE_PORT)?.unwrap_or(DEFAULT_STORAGE_PORT),
            database: vars.required(env::STORAGE_DB)?,
            credentials: Credentials {
                username: vars.required(env::STORAGE_USER)?,
                password: vars.required(env::STORAGE_PASS)?,
            },
        };

        let max_messages = match vars.parsed::<u64>(env::MAX_MESSAGES)? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: env::MAX_MESSAGES,
                    value: "0".to_string(),
                    reason: "must be a positive integer".to_string(),
                });
            }
            bound => bound,
        };

        let connect_attempts = vars
            .parsed(CONNECT_MAX_ATTEMPTS)?
            .unwrap_or(DEFAULT_CONNECT_ATTEMPTS)
            .max(1);
        let connect_delay = vars
            .parsed(CONNECT_RETRY_DELAY_MS)?
            .unwrap_or(DEFAULT_CONNECT_DELAY_MS);
        let redelivery_delay = vars
            .parsed(REDELIVERY_DELAY_MS)?
            .unwrap_or(DEFAULT_REDELIVERY_DELAY_MS);

        Ok(Self {
            queue,
            storage,
            max_messages,
            connect_retry: RetryPolicy::fixed(connect_attempts, Duration::from_millis(connect_delay)),
            redelivery_delay: Duration::from_millis(redelivery_delay),
        })
    }

    /// Log the effective configuration. Credentials are never logged.
    pub fn log_banner(&self) {
        info!(
            queue_host = %self.queue.host,
            queue_port = self.queue.port,
            queue = %self.queue.name,
            consumer = %self.queue.consumer,
            dead_letter = self.queue.dead_letter.as_deref().unwrap_or("none"),
            storage_host = %self.storage.host,
            storage_port = self.storage.port,
            database = %self.storage.database,
            max_messages = %self
                .max_messages
                .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
            "payment worker starting"
        );
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// Unset and blank values are both treated as absent.
    fn optional(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parsed<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: core::str::FromStr,
        T::Err: core::fmt::Display,
    {
        self.optional(var)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (env::QUEUE_HOST, "redis"),
            (env::QUEUE_USER, "worker"),
            (env::QUEUE_PASS, "s3cret"),
            (env::QUEUE_NAME, "payments"),
            (env::STORAGE_HOST, "postgres"),
            (env::STORAGE_DB, "payments_db"),
            (env::STORAGE_USER, "app"),
            (env::STORAGE_PASS, "hunter2"),
            ("HOSTNAME", "paymentjob-a-1234-xyz"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<WorkerConfig, ConfigError> {
        WorkerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        let config = load(&base_env()).unwrap();

        assert_eq!(config.queue.port, DEFAULT_QUEUE_PORT);
        assert_eq!(config.storage.port, DEFAULT_STORAGE_PORT);
        assert_eq!(config.max_messages, None);
        assert_eq!(config.queue.consumer, "paymentjob-a-1234-xyz");
        assert_eq!(config.connect_retry.max_attempts, DEFAULT_CONNECT_ATTEMPTS);
        assert_eq!(config.queue.dead_letter, None);
    }

    #[test]
    fn bound_is_parsed() {
        let mut vars = base_env();
        vars.insert(env::MAX_MESSAGES, "25");
        assert_eq!(load(&vars).unwrap().max_messages, Some(25));
    }

    #[test]
    fn blank_bound_means_unbounded() {
        let mut vars = base_env();
        vars.insert(env::MAX_MESSAGES, "");
        assert_eq!(load(&vars).unwrap().max_messages, None);
    }

    #[test]
    fn zero_bound_is_invalid() {
        let mut vars = base_env();
        vars.insert(env::MAX_MESSAGES, "0");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: env::MAX_MESSAGES, .. })
        ));
    }

    #[test]
    fn missing_queue_name_is_reported() {
        let mut vars = base_env();
        vars.remove(env::QUEUE_NAME);
        assert_eq!(load(&vars), Err(ConfigError::Missing(env::QUEUE_NAME)));
    }

    #[test]
    fn unparsable_port_is_reported() {
        let mut vars = base_env();
        vars.insert(env::STORAGE_PORT, "fifty");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: env::STORAGE_PORT, .. })
        ));
    }

    #[test]
    fn debug_output_redacts_passwords() {
        let config = load(&base_env()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("hunter2"));
    }
}
