//! `ClusterApi` over a live API server.
//!
//! Error mapping:
//!
//! | kube error | HTTP | `ClusterError` |
//! |------------|------|----------------|
//! | Api, reason AlreadyExists | 409 | `AlreadyExists` |
//! | Api, other reason | 409 | `Conflict` |
//! | Api | 429, 5xx | `Unavailable` |
//! | Api | other 4xx | `Rejected` |
//! | SerdeError | n/a | `Serialization` |
//! | anything else (transport, auth plumbing) | n/a | `Unavailable` |

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, EventSource, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, instrument};

use paymentjob_core::{PaymentJob, PaymentJobStatus};

use super::{ClusterApi, ClusterError, CreateOutcome, ResourceEvent};
use crate::key::ObjectKey;

/// Component name on Events and field manager on writes.
pub const REPORTER: &str = "paymentjob-operator";

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    instance: String,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| REPORTER.to_string());
        Self { client, instance }
    }

    fn resources(&self, namespace: &str) -> Api<PaymentJob> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_resource(&self, key: &ObjectKey) -> Result<Option<PaymentJob>, ClusterError> {
        self.resources(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(map_kube_error)
    }

    async fn secret_keys(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeSet<String>>, ClusterError> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)?;

        Ok(secret.map(|secret| {
            let mut keys = BTreeSet::new();
            keys.extend(secret.data.unwrap_or_default().into_keys());
            keys.extend(secret.string_data.unwrap_or_default().into_keys());
            keys
        }))
    }

    #[instrument(skip(self, job), fields(job = job.metadata.name.as_deref().unwrap_or_default()), err)]
    async fn create_job(&self, job: &Job) -> Result<CreateOutcome, ClusterError> {
        let namespace = job.namespace().unwrap_or_default();
        let api = Api::<Job>::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(REPORTER.to_string()),
            ..Default::default()
        };

        match api.create(&params, job).await.map_err(map_kube_error) {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(ClusterError::AlreadyExists(_)) => Ok(CreateOutcome::AlreadyExists),
            Err(err) => Err(err),
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError> {
        Api::<Job>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    #[instrument(skip(self, status), fields(resource = %key, phase = %status.phase), err)]
    async fn patch_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &PaymentJobStatus,
    ) -> Result<(), ClusterError> {
        let mut body = json!({ "status": status });
        if let Some(version) = resource_version {
            body["metadata"] = json!({ "resourceVersion": version });
        }

        let params = PatchParams {
            field_manager: Some(REPORTER.to_string()),
            ..Default::default()
        };
        self.resources(&key.namespace)
            .patch_status(&key.name, &params, &Patch::Merge(&body))
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn publish_event(
        &self,
        resource: &PaymentJob,
        event: &ResourceEvent,
    ) -> Result<(), ClusterError> {
        let namespace = resource.namespace().unwrap_or_default();
        let now = Time(Utc::now());
        let record = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", resource.name_any())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: resource.object_ref(&()),
            reason: Some(event.reason.to_string()),
            message: Some(event.note.clone()),
            type_: Some(event.severity.as_str().to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(REPORTER.to_string()),
                host: None,
            }),
            reporting_component: Some(REPORTER.to_string()),
            reporting_instance: Some(self.instance.clone()),
            ..Default::default()
        };

        Api::<Event>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), &record)
            .await
            .map_err(map_kube_error)?;
        debug!(reason = event.reason, "event published");
        Ok(())
    }
}

pub(crate) fn map_kube_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            409 if response.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(response.message)
            }
            409 => ClusterError::Conflict(response.message),
            429 | 500..=599 => ClusterError::Unavailable(response.message),
            code => ClusterError::Rejected {
                code,
                message: response.message,
            },
        },
        kube::Error::SerdeError(e) => ClusterError::Serialization(e.to_string()),
        other => ClusterError::Unavailable(other.to_string()),
    }
}
