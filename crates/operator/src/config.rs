//! Operator configuration from the environment.

use std::time::Duration;

use thiserror::Error;

use paymentjob_core::RetryPolicy;

pub const WATCH_NAMESPACE: &str = "WATCH_NAMESPACE";
pub const RESYNC_INTERVAL_SECS: &str = "RESYNC_INTERVAL_SECS";
pub const STATUS_RETRY_ATTEMPTS: &str = "STATUS_RETRY_ATTEMPTS";

const DEFAULT_RESYNC_SECS: u64 = 10;
const DEFAULT_STATUS_ATTEMPTS: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches the whole cluster.
    pub namespace: Option<String>,
    /// Period of the full resync.
    pub resync_interval: Duration,
    /// Policy for re-running a reconcile after a status write conflict.
    pub status_retry: RetryPolicy,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECS),
            status_retry: status_policy(DEFAULT_STATUS_ATTEMPTS),
        }
    }
}

fn status_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential(attempts, Duration::from_millis(100), Duration::from_secs(2))
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let resync_secs = match get(RESYNC_INTERVAL_SECS) {
            None => DEFAULT_RESYNC_SECS,
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                Ok(_) => return Err(invalid(RESYNC_INTERVAL_SECS, value, "must be positive")),
                Err(e) => return Err(invalid(RESYNC_INTERVAL_SECS, value, &e.to_string())),
            },
        };

        let attempts = match get(STATUS_RETRY_ATTEMPTS) {
            None => DEFAULT_STATUS_ATTEMPTS,
            Some(value) => match value.parse::<u32>() {
                Ok(n) if n > 0 => n,
                Ok(_) => return Err(invalid(STATUS_RETRY_ATTEMPTS, value, "must be positive")),
                Err(e) => return Err(invalid(STATUS_RETRY_ATTEMPTS, value, &e.to_string())),
            },
        };

        Ok(Self {
            namespace: get(WATCH_NAMESPACE),
            resync_interval: Duration::from_secs(resync_secs),
            status_retry: status_policy(attempts),
        })
    }
}

fn invalid(var: &'static str, value: String, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<OperatorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_watch_all_namespaces() {
        let config = load(&[]).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.namespace, None);
        assert_eq!(config.resync_interval, Duration::from_secs(10));
        assert_eq!(config.status_retry.max_attempts, 5);
    }

    #[test]
    fn namespace_and_intervals_are_read() {
        let config = load(&[
            (WATCH_NAMESPACE, "payments"),
            (RESYNC_INTERVAL_SECS, "30"),
            (STATUS_RETRY_ATTEMPTS, "2"),
        ])
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("payments"));
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.status_retry.max_attempts, 2);
    }

    #[test]
    fn zero_resync_interval_is_rejected() {
        assert!(matches!(
            load(&[(RESYNC_INTERVAL_SECS, "0")]),
            Err(ConfigError::Invalid { var: RESYNC_INTERVAL_SECS, .. })
        ));
    }

    #[test]
    fn non_numeric_attempts_are_rejected() {
        assert!(load(&[(STATUS_RETRY_ATTEMPTS, "many")]).is_err());
    }
}
