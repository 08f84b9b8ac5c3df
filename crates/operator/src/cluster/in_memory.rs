//! In-memory cluster for tests.
//!
//! Models the API server behavior the reconciler depends on:
//! `resourceVersion` preconditions on status writes, generation bumps on
//! spec changes, idempotent Job creation and owner-reference cascade delete.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use paymentjob_core::{PaymentJob, PaymentJobSpec, PaymentJobStatus};

use super::{ClusterApi, ClusterError, CreateOutcome, ResourceEvent};
use crate::key::ObjectKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub resource: ObjectKey,
    pub event: ResourceEvent,
}

#[derive(Debug, Default)]
struct ClusterState {
    resources: BTreeMap<ObjectKey, PaymentJob>,
    secrets: BTreeMap<ObjectKey, BTreeSet<String>>,
    jobs: BTreeMap<ObjectKey, Job>,
    events: Vec<RecordedEvent>,
    status_history: Vec<(ObjectKey, PaymentJobStatus)>,
    job_creations: u64,
    next_version: u64,
    next_uid: u64,
    injected_conflicts: u32,
    reject_job_creates: Option<(u16, String)>,
}

impl ClusterState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the resource, or replace its spec. A changed spec bumps
    /// `metadata.generation`.
    pub fn apply(&self, namespace: &str, name: &str, spec: PaymentJobSpec) -> ObjectKey {
        let key = ObjectKey::new(namespace, name);
        let mut state = self.state();
        let version = state.bump_version();

        if let Some(existing) = state.resources.get_mut(&key) {
            if existing.spec != spec {
                existing.spec = spec;
                existing.metadata.generation = Some(existing.metadata.generation.unwrap_or(1) + 1);
            }
            existing.metadata.resource_version = Some(version);
            return key;
        }

        state.next_uid += 1;
        let mut resource = PaymentJob::new(name, spec);
        resource.metadata.namespace = Some(namespace.to_string());
        resource.metadata.uid = Some(format!("uid-{:04}", state.next_uid));
        resource.metadata.generation = Some(1);
        resource.metadata.resource_version = Some(version);
        resource.metadata.creation_timestamp = Some(Time(Utc::now()));
        state.resources.insert(key.clone(), resource);
        key
    }

    /// Delete the resource and every Job it controls.
    pub fn delete(&self, key: &ObjectKey) {
        let mut state = self.state();
        let Some(resource) = state.resources.remove(key) else {
            return;
        };
        let uid = resource.metadata.uid;
        state.jobs.retain(|_, job| {
            !job.owner_references()
                .iter()
                .any(|owner| Some(&owner.uid) == uid.as_ref() && owner.controller == Some(true))
        });
    }

    pub fn put_secret(&self, namespace: &str, name: &str, keys: &[&str]) {
        self.state().secrets.insert(
            ObjectKey::new(namespace, name),
            keys.iter().map(|k| k.to_string()).collect(),
        );
    }

    /// Delete a Job without touching its owner.
    pub fn delete_job(&self, namespace: &str, name: &str) {
        self.state().jobs.remove(&ObjectKey::new(namespace, name));
    }

    pub fn set_job_status(&self, namespace: &str, name: &str, status: JobStatus) {
        if let Some(job) = self.state().jobs.get_mut(&ObjectKey::new(namespace, name)) {
            job.status = Some(status);
        }
    }

    /// The next `count` conditional status writes fail as if another writer
    /// got there first.
    pub fn inject_status_conflicts(&self, count: u32) {
        self.state().injected_conflicts = count;
    }

    /// Every Job create fails with the given HTTP code.
    pub fn reject_job_creates(&self, code: u16, message: &str) {
        self.state().reject_job_creates = Some((code, message.to_string()));
    }

    pub fn resource(&self, key: &ObjectKey) -> Option<PaymentJob> {
        self.state().resources.get(key).cloned()
    }

    pub fn status(&self, key: &ObjectKey) -> Option<PaymentJobStatus> {
        self.resource(key).and_then(|r| r.status)
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state().jobs.get(&ObjectKey::new(namespace, name)).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    /// Successful Job creations, not counting `AlreadyExists` answers.
    pub fn job_creations(&self) -> u64 {
        self.state().job_creations
    }

    /// Every status accepted for `key`, oldest first.
    pub fn status_history(&self, key: &ObjectKey) -> Vec<PaymentJobStatus> {
        self.state()
            .status_history
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, status)| status.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state().events.clone()
    }

    pub fn event_reasons(&self, key: &ObjectKey) -> Vec<&'static str> {
        self.state()
            .events
            .iter()
            .filter(|e| &e.resource == key)
            .map(|e| e.event.reason)
            .collect()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_resource(&self, key: &ObjectKey) -> Result<Option<PaymentJob>, ClusterError> {
        Ok(self.resource(key))
    }

    async fn secret_keys(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeSet<String>>, ClusterError> {
        Ok(self
            .state()
            .secrets
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn create_job(&self, job: &Job) -> Result<CreateOutcome, ClusterError> {
        let key = ObjectKey::new(job.namespace().unwrap_or_default(), job.name_any());
        let mut state = self.state();

        if let Some((code, message)) = state.reject_job_creates.clone() {
            return Err(ClusterError::Rejected { code, message });
        }
        if state.jobs.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        state.next_uid += 1;
        let mut stored = job.clone();
        stored.metadata.uid = Some(format!("uid-{:04}", state.next_uid));
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.resource_version = Some(state.bump_version());
        state.jobs.insert(key, stored);
        state.job_creations += 1;
        Ok(CreateOutcome::Created)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, ClusterError> {
        Ok(self.job(namespace, name))
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &PaymentJobStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();

        if resource_version.is_some() && state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            let version = state.bump_version();
            if let Some(resource) = state.resources.get_mut(key) {
                resource.metadata.resource_version = Some(version);
            }
            return Err(ClusterError::Conflict(format!(
                "the object {key} has been modified; please apply your changes to the latest version"
            )));
        }

        let version = state.bump_version();
        let Some(resource) = state.resources.get_mut(key) else {
            return Err(ClusterError::Rejected {
                code: 404,
                message: format!("paymentjobs {key} not found"),
            });
        };
        if let Some(expected) = resource_version {
            if resource.metadata.resource_version.as_deref() != Some(expected) {
                return Err(ClusterError::Conflict(format!(
                    "resourceVersion {expected} is stale for {key}"
                )));
            }
        }

        resource.status = Some(status.clone());
        resource.metadata.resource_version = Some(version);
        state.status_history.push((key.clone(), status.clone()));
        Ok(())
    }

    async fn publish_event(
        &self,
        resource: &PaymentJob,
        event: &ResourceEvent,
    ) -> Result<(), ClusterError> {
        let key = ObjectKey::new(resource.namespace().unwrap_or_default(), resource.name_any());
        self.state().events.push(RecordedEvent {
            resource: key,
            event: event.clone(),
        });
        Ok(())
    }
}
