//! Deterministic worker Job for a `PaymentJob`.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use paymentjob_core::env;
use paymentjob_core::PaymentJob;

use crate::error::ReconcileError;
use crate::key::ObjectKey;

pub const JOB_NAME_PREFIX: &str = "paymentjob-";
pub const CONTAINER_NAME: &str = "payment-worker";
pub const BACKOFF_LIMIT: i32 = 3;
pub const TTL_SECONDS_AFTER_FINISHED: i32 = 300;

const MAX_BASE_LEN: usize = 54;
const MAX_LABEL_VALUE_LEN: usize = 63;

/// `paymentjob-<name>` cut to 54 characters, plus `-` and 8 hex characters
/// of SHA-256 over `<namespace>/<name>`. At most 63 characters.
pub fn job_name(namespace: &str, name: &str) -> String {
    let digest = Sha256::digest(format!("{namespace}/{name}").as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    let base: String = format!("{JOB_NAME_PREFIX}{name}")
        .chars()
        .take(MAX_BASE_LEN)
        .collect();
    format!("{base}-{suffix}")
}

/// Labels on the Job and its pod template.
pub fn labels(name: &str) -> BTreeMap<String, String> {
    let value: String = name.chars().take(MAX_LABEL_VALUE_LEN).collect();
    let value = value.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    BTreeMap::from([
        ("app".to_string(), "payment-worker".to_string()),
        ("paymentjob".to_string(), value.to_string()),
        ("managed-by".to_string(), "paymentjob-operator".to_string()),
    ])
}

fn plain(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

/// Worker environment. Credentials are Secret key references, never values.
pub fn environment(resource: &PaymentJob) -> Vec<EnvVar> {
    let spec = &resource.spec;
    let queue_secret = spec.queue.secret_ref.name.as_str();
    let storage_secret = spec.storage.secret_ref.name.as_str();

    let mut vars = vec![
        plain(env::QUEUE_HOST, spec.queue.host.as_str()),
        plain(env::QUEUE_PORT, spec.queue.port.to_string()),
        from_secret(env::QUEUE_USER, queue_secret, env::SECRET_USERNAME_KEY),
        from_secret(env::QUEUE_PASS, queue_secret, env::SECRET_PASSWORD_KEY),
        plain(env::QUEUE_NAME, spec.queue_name.as_str()),
        plain(env::STORAGE_HOST, spec.storage.host.as_str()),
        plain(env::STORAGE_PORT, spec.storage.port.to_string()),
        plain(env::STORAGE_DB, spec.storage.database.as_str()),
        from_secret(env::STORAGE_USER, storage_secret, env::SECRET_USERNAME_KEY),
        from_secret(env::STORAGE_PASS, storage_secret, env::SECRET_PASSWORD_KEY),
    ];
    if let Some(bound) = spec.max_messages {
        vars.push(plain(env::MAX_MESSAGES, bound.to_string()));
    }
    vars
}

/// Build the Job owned by `resource`.
///
/// The output depends only on the resource's namespace, name, uid and spec.
pub fn build_job(resource: &PaymentJob) -> Result<Job, ReconcileError> {
    let name = resource.name_any();
    let namespace = resource
        .namespace()
        .ok_or_else(|| ReconcileError::MissingMetadata {
            key: ObjectKey::new("", name.clone()),
            field: "namespace",
        })?;
    let owner = resource
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::MissingMetadata {
            key: ObjectKey::new(namespace.clone(), name.clone()),
            field: "uid",
        })?;
    let labels = labels(&name);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(resource.spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(environment(resource)),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("100m", "128Mi")),
            limits: Some(quantities("500m", "256Mi")),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&namespace, &name)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
