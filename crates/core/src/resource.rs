//! The `PaymentJob` custom resource.
//!
//! `spec` is owned by the user; `status` is a separate subresource written
//! only by the operator.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::phase::Phase;

pub const API_GROUP: &str = "payments.example.com";
pub const API_VERSION: &str = "v1alpha1";
pub const KIND: &str = "PaymentJob";

/// Redis default port.
pub const DEFAULT_QUEUE_PORT: u16 = 6379;
/// PostgreSQL default port.
pub const DEFAULT_STORAGE_PORT: u16 = 5432;

/// Declared intent: drain `queueName` into the `payments` table of `storage`.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "payments.example.com",
    version = "v1alpha1",
    kind = "PaymentJob",
    plural = "paymentjobs",
    shortname = "pj",
    namespaced,
    status = "PaymentJobStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Job","type":"string","jsonPath":".status.jobName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PaymentJobSpec {
    /// Durable queue to drain.
    pub queue_name: String,
    /// Worker container image.
    pub image: String,
    /// Stop after this many messages; absent means run until the queue is drained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub max_messages: Option<u64>,
    pub queue: QueueEndpoint,
    pub storage: StorageEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueEndpoint {
    pub host: String,
    #[serde(default = "default_queue_port")]
    pub port: u16,
    pub secret_ref: SecretReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageEndpoint {
    pub host: String,
    #[serde(default = "default_storage_port")]
    pub port: u16,
    pub database: String,
    pub secret_ref: SecretReference,
}

/// Reference to a Secret in the resource's namespace holding `username` and `password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

fn default_queue_port() -> u16 {
    DEFAULT_QUEUE_PORT
}

fn default_storage_port() -> u16 {
    DEFAULT_STORAGE_PORT
}

/// Observed state, written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentJobStatus {
    #[serde(default)]
    pub phase: Phase,
    /// Name of the worker Job owned by this resource.
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    /// First time the Job was observed running.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Time the resource entered a terminal phase.
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    /// `metadata.generation` last acknowledged by the reconciler.
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl PaymentJobStatus {
    /// Compare everything except `lastUpdateTime`, which changes on every write.
    pub fn same_observation(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.job_name == other.job_name
            && self.message == other.message
            && self.start_time == other.start_time
            && self.completion_time == other.completion_time
            && self.observed_generation == other.observed_generation
    }
}

impl PaymentJobSpec {
    /// Checks that need no cluster access. Credential references are resolved
    /// separately by the reconciler.
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        let required = [
            ("queueName", self.queue_name.as_str()),
            ("image", self.image.as_str()),
            ("queue.host", self.queue.host.as_str()),
            ("queue.secretRef.name", self.queue.secret_ref.name.as_str()),
            ("storage.host", self.storage.host.as_str()),
            ("storage.database", self.storage.database.as_str()),
            ("storage.secretRef.name", self.storage.secret_ref.name.as_str()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ValidationError::missing(field));
        }

        match self.max_messages {
            Some(0) => Err(ValidationError::InvalidBound(0)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;
    use serde_json::json;

    fn spec_json() -> serde_json::Value {
        json!({
            "queueName": "payments",
            "image": "registry.local/payment-worker:1.0",
            "maxMessages": 10,
            "queue": { "host": "redis", "secretRef": { "name": "queue-creds" } },
            "storage": {
                "host": "postgres",
                "database": "payments_db",
                "secretRef": { "name": "db-creds" }
            }
        })
    }

    #[test]
    fn ports_default_to_well_known_values() {
        let spec: PaymentJobSpec = serde_json::from_value(spec_json()).unwrap();
        assert_eq!(spec.queue.port, DEFAULT_QUEUE_PORT);
        assert_eq!(spec.storage.port, DEFAULT_STORAGE_PORT);
        assert_eq!(spec.max_messages, Some(10));
    }

    #[test]
    fn bound_is_optional() {
        let mut value = spec_json();
        value.as_object_mut().unwrap().remove("maxMessages");
        let spec: PaymentJobSpec = serde_json::from_value(value).unwrap();
        assert_eq!(spec.max_messages, None);
        assert!(spec.validate_shape().is_ok());
    }

    #[test]
    fn blank_required_fields_are_rejected() {
        let mut spec: PaymentJobSpec = serde_json::from_value(spec_json()).unwrap();
        spec.image = "  ".to_string();
        assert_eq!(
            spec.validate_shape(),
            Err(ValidationError::MissingField { field: "image" })
        );
    }

    #[test]
    fn zero_bound_is_rejected() {
        let mut spec: PaymentJobSpec = serde_json::from_value(spec_json()).unwrap();
        spec.max_messages = Some(0);
        assert_eq!(spec.validate_shape(), Err(ValidationError::InvalidBound(0)));
    }

    #[test]
    fn status_uses_camel_case_fields() {
        let status = PaymentJobStatus {
            phase: Phase::Running,
            job_name: Some("paymentjob-a-12345678".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Running");
        assert_eq!(value["jobName"], "paymentjob-a-12345678");
        assert!(value.get("lastUpdateTime").is_some());
    }

    #[test]
    fn same_observation_ignores_timestamp() {
        let a = PaymentJobStatus {
            last_update_time: Some(Utc::now()),
            ..Default::default()
        };
        let b = PaymentJobStatus::default();
        assert!(a.same_observation(&b));
    }

    #[test]
    fn crd_has_status_subresource() {
        let crd = PaymentJob::crd();
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, KIND);
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, API_VERSION);
        assert!(version.subresources.as_ref().unwrap().status.is_some());
    }
}
