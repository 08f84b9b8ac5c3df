//! The reconcile state machine.
//!
//! ```text
//! no status.jobName ──validate──▶ create Job ──▶ Pending(jobName)
//!        │                            │
//!        └─invalid──▶ Failed          └─rejected──▶ Failed
//!
//! status.jobName set ──terminal phase──▶ (nothing)
//!        ├─Job missing──▶ Failed, never recreated
//!        └─Job present──▶ project ──guard──▶ Running | Succeeded | Failed
//! ```
//!
//! Every status write carries the `resourceVersion` that was read, so a
//! concurrent writer turns into a conflict and the whole reconcile is re-run
//! against fresh state.

use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use paymentjob_core::env::{SECRET_PASSWORD_KEY, SECRET_USERNAME_KEY};
use paymentjob_core::retry::retry;
use paymentjob_core::{PaymentJob, PaymentJobStatus, Phase, RetryPolicy, ValidationError};

use crate::cluster::{ClusterApi, ClusterError, CreateOutcome, ResourceEvent};
use crate::error::ReconcileError;
use crate::key::ObjectKey;
use crate::manifest;
use crate::projector::{UnitCondition, project};

pub const SPEC_DRIFT_MESSAGE: &str =
    "Spec updates are not applied to running Jobs. Delete and recreate.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource no longer exists.
    Absent,
    /// Nothing to write.
    Unchanged,
    Updated { phase: Phase },
    /// Status writes kept conflicting; the next event or resync retries.
    Deferred,
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    conflict_policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, conflict_policy: RetryPolicy) -> Self {
        Self {
            cluster,
            conflict_policy,
        }
    }

    /// Converge one resource. Safe to call any number of times.
    #[instrument(skip(self), fields(resource = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        let result = retry(&self.conflict_policy, "reconcile", |_| self.reconcile_once(key)).await;
        match result {
            Err(ReconcileError::Cluster(ClusterError::Conflict(message))) => {
                warn!(
                    attempts = self.conflict_policy.max_attempts,
                    error = %message,
                    "status write kept conflicting, deferring to next resync"
                );
                Ok(ReconcileOutcome::Deferred)
            }
            other => other,
        }
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(resource) = self.cluster.get_resource(key).await? else {
            debug!("resource gone");
            return Ok(ReconcileOutcome::Absent);
        };
        let current = resource.status.clone().unwrap_or_default();

        match current.job_name.clone() {
            None => self.provision(key, &resource, &current).await,
            Some(_) if current.phase.is_terminal() => Ok(ReconcileOutcome::Unchanged),
            Some(job_name) => self.observe(key, &resource, &current, &job_name).await,
        }
    }

    async fn provision(
        &self,
        key: &ObjectKey,
        resource: &PaymentJob,
        current: &PaymentJobStatus,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if let Err(invalid) = self.validate(&key.namespace, resource).await? {
            info!(error = %invalid, "spec rejected");
            let message = invalid.to_string();
            let next = failed(current, None, message.clone(), resource.metadata.generation);
            let event = ResourceEvent::warning(invalid.reason(), message);
            return self.write_status(key, resource, current, next, Some(event)).await;
        }

        let job = manifest::build_job(resource)?;
        let job_name = job.name_any();
        match self.cluster.create_job(&job).await {
            Ok(CreateOutcome::Created) => info!(job = %job_name, "job created"),
            Ok(CreateOutcome::AlreadyExists) => {
                info!(job = %job_name, "job already exists, adopting")
            }
            Err(err @ ClusterError::Rejected { .. }) => {
                warn!(job = %job_name, error = %err, "job create rejected");
                let message = format!("failed to create Job: {err}");
                let next = failed(current, None, message.clone(), resource.metadata.generation);
                let event = ResourceEvent::warning("JobFailed", message);
                return self.write_status(key, resource, current, next, Some(event)).await;
            }
            Err(err) => return Err(err.into()),
        }

        // Published with the write that records the jobName, even when an
        // earlier attempt did the create.
        let event = ResourceEvent::normal("JobCreated", format!("Created Job {job_name}"));
        let next = PaymentJobStatus {
            phase: Phase::Pending,
            job_name: Some(job_name.clone()),
            message: Some(format!("Job {job_name} created")),
            observed_generation: resource.metadata.generation,
            ..Default::default()
        };
        self.write_status(key, resource, current, next, Some(event)).await
    }

    /// Shape checks first, then both credential Secrets. Only cluster
    /// failures are errors; an invalid spec is a value.
    async fn validate(
        &self,
        namespace: &str,
        resource: &PaymentJob,
    ) -> Result<Result<(), ValidationError>, ClusterError> {
        let spec = &resource.spec;
        if let Err(invalid) = spec.validate_shape() {
            return Ok(Err(invalid));
        }

        let references = [
            ("queue.secretRef.name", spec.queue.secret_ref.name.as_str()),
            ("storage.secretRef.name", spec.storage.secret_ref.name.as_str()),
        ];
        for (field, secret) in references {
            let Some(keys) = self.cluster.secret_keys(namespace, secret).await? else {
                return Ok(Err(ValidationError::MissingSecret {
                    field,
                    namespace: namespace.to_string(),
                    name: secret.to_string(),
                }));
            };
            for required in [SECRET_USERNAME_KEY, SECRET_PASSWORD_KEY] {
                if !keys.contains(required) {
                    return Ok(Err(ValidationError::MissingSecretKey {
                        field,
                        namespace: namespace.to_string(),
                        name: secret.to_string(),
                        key: required,
                    }));
                }
            }
        }
        Ok(Ok(()))
    }

    async fn observe(
        &self,
        key: &ObjectKey,
        resource: &PaymentJob,
        current: &PaymentJobStatus,
        job_name: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(job) = self.cluster.get_job(&key.namespace, job_name).await? else {
            warn!(job = job_name, "job missing");
            let message =
                format!("Job {job_name} was deleted outside the operator and will not be recreated");
            let next = failed(
                current,
                Some(job_name.to_string()),
                message.clone(),
                current.observed_generation,
            );
            let event = ResourceEvent::warning("JobMissing", message);
            return self.write_status(key, resource, current, next, Some(event)).await;
        };

        let now = Utc::now();
        let projection = project(current.phase, &UnitCondition::from_job(&job));
        let mut next = current.clone();
        let mut event = None;

        if current.phase.can_advance_to(projection.phase) {
            next.phase = projection.phase;
            next.message = projection.message;
            let job_started = job
                .status
                .as_ref()
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0);

            match next.phase {
                Phase::Running => {
                    next.start_time.get_or_insert(now);
                }
                Phase::Succeeded => {
                    next.start_time = next.start_time.or(job_started);
                    next.completion_time = Some(now);
                    event = Some(ResourceEvent::normal(
                        "JobSucceeded",
                        format!("Job {job_name} completed successfully"),
                    ));
                }
                Phase::Failed => {
                    next.start_time = next.start_time.or(job_started);
                    next.completion_time = Some(now);
                    let detail = next.message.clone().unwrap_or_default();
                    event = Some(ResourceEvent::warning(
                        "JobFailed",
                        format!("Job {job_name} failed: {detail}"),
                    ));
                }
                Phase::Pending => {}
            }
        }

        let generation = resource.metadata.generation;
        if let (Some(seen), Some(observed)) = (generation, current.observed_generation) {
            if seen > observed {
                info!(generation = seen, observed, "spec changed after job creation");
                next.message = Some(SPEC_DRIFT_MESSAGE.to_string());
                next.observed_generation = Some(seen);
            }
        }

        self.write_status(key, resource, current, next, event).await
    }

    /// Write `next` if it differs from `current` and does not move the phase
    /// backwards for the same Job. Publishes `event` after a successful write.
    async fn write_status(
        &self,
        key: &ObjectKey,
        resource: &PaymentJob,
        current: &PaymentJobStatus,
        mut next: PaymentJobStatus,
        event: Option<ResourceEvent>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if next.same_observation(current) {
            return Ok(ReconcileOutcome::Unchanged);
        }
        let permitted = next.job_name != current.job_name
            || next.phase == current.phase
            || current.phase.can_advance_to(next.phase);
        if !permitted {
            warn!(from = %current.phase, to = %next.phase, "refusing phase regression");
            return Ok(ReconcileOutcome::Unchanged);
        }

        next.last_update_time = Some(Utc::now());
        let version = resource.resource_version();
        self.cluster
            .patch_status(key, version.as_deref(), &next)
            .await?;
        info!(
            phase = %next.phase,
            job = next.job_name.as_deref().unwrap_or_default(),
            "status updated"
        );

        if let Some(event) = event {
            if let Err(err) = self.cluster.publish_event(resource, &event).await {
                warn!(reason = event.reason, error = %err, "failed to publish event");
            }
        }
        Ok(ReconcileOutcome::Updated { phase: next.phase })
    }
}

/// A Failed status, keeping the original completion time when the resource
/// was already Failed so repeated reconciles do not rewrite it.
fn failed(
    current: &PaymentJobStatus,
    job_name: Option<String>,
    message: String,
    observed_generation: Option<i64>,
) -> PaymentJobStatus {
    let completion_time = match current.phase {
        Phase::Failed => current.completion_time,
        _ => None,
    }
    .or_else(|| Some(Utc::now()));

    PaymentJobStatus {
        phase: Phase::Failed,
        job_name,
        message: Some(message),
        start_time: current.start_time,
        completion_time,
        observed_generation,
        last_update_time: current.last_update_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::api::batch::v1::JobStatus;
    use paymentjob_core::{PaymentJobSpec, QueueEndpoint, SecretReference, StorageEndpoint};

    use crate::cluster::InMemoryCluster;

    const NS: &str = "payments";

    fn spec() -> PaymentJobSpec {
        PaymentJobSpec {
            queue_name: "settlements".to_string(),
            image: "registry.local/payment-worker:1.4.0".to_string(),
            max_messages: Some(10),
            queue: QueueEndpoint {
                host: "redis".to_string(),
                port: 6379,
                secret_ref: SecretReference {
                    name: "queue-creds".to_string(),
                },
            },
            storage: StorageEndpoint {
                host: "postgres".to_string(),
                port: 5432,
                database: "ledger".to_string(),
                secret_ref: SecretReference {
                    name: "ledger-creds".to_string(),
                },
            },
        }
    }

    fn setup() -> (Arc<InMemoryCluster>, Reconciler) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_secret(NS, "queue-creds", &["username", "password"]);
        cluster.put_secret(NS, "ledger-creds", &["username", "password"]);
        let reconciler = Reconciler::new(
            cluster.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        );
        (cluster, reconciler)
    }

    #[tokio::test]
    async fn missing_resource_is_absent() {
        let (_, reconciler) = setup();
        let outcome = reconciler.reconcile(&ObjectKey::new(NS, "ghost")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Absent);
    }

    #[tokio::test]
    async fn valid_resource_gets_a_pending_job() {
        let (cluster, reconciler) = setup();
        let key = cluster.apply(NS, "nightly", spec());

        let outcome = reconciler.reconcile(&key).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { phase: Phase::Pending });
        let status = cluster.status(&key).unwrap();
        let job_name = status.job_name.clone().unwrap();
        assert_eq!(job_name, manifest::job_name(NS, "nightly"));
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.last_update_time.is_some());
        assert!(cluster.job(NS, &job_name).is_some());
        assert_eq!(cluster.event_reasons(&key), vec!["JobCreated"]);
    }

    #[tokio::test]
    async fn secret_without_password_fails_validation() {
        let (cluster, reconciler) = setup();
        cluster.put_secret(NS, "ledger-creds", &["username"]);
        let key = cluster.apply(NS, "nightly", spec());

        reconciler.reconcile(&key).await.unwrap();

        let status = cluster.status(&key).unwrap();
        assert_eq!(status.phase, Phase::Failed);
        assert!(status.message.unwrap().contains("'password'"));
        assert!(cluster.jobs().is_empty());
        assert_eq!(cluster.event_reasons(&key), vec!["ValidationFailed"]);
    }

    #[tokio::test]
    async fn repeated_validation_failure_is_not_rewritten() {
        let (cluster, reconciler) = setup();
        let mut invalid = spec();
        invalid.max_messages = Some(0);
        let key = cluster.apply(NS, "nightly", invalid);

        reconciler.reconcile(&key).await.unwrap();
        let second = reconciler.reconcile(&key).await.unwrap();

        assert_eq!(second, ReconcileOutcome::Unchanged);
        assert_eq!(cluster.status_history(&key).len(), 1);
        assert_eq!(cluster.event_reasons(&key).len(), 1);
    }

    #[tokio::test]
    async fn running_job_sets_start_time() {
        let (cluster, reconciler) = setup();
        let key = cluster.apply(NS, "nightly", spec());
        reconciler.reconcile(&key).await.unwrap();
        let job_name = cluster.status(&key).unwrap().job_name.unwrap();

        cluster.set_job_status(
            NS,
            &job_name,
            JobStatus {
                active: Some(1),
                ..Default::default()
            },
        );
        let outcome = reconciler.reconcile(&key).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { phase: Phase::Running });
        let status = cluster.status(&key).unwrap();
        assert!(status.start_time.is_some());
        assert!(status.completion_time.is_none());
    }

    #[tokio::test]
    async fn terminal_phase_is_not_reexamined() {
        let (cluster, reconciler) = setup();
        let key = cluster.apply(NS, "nightly", spec());
        reconciler.reconcile(&key).await.unwrap();
        let job_name = cluster.status(&key).unwrap().job_name.unwrap();
        cluster.set_job_status(
            NS,
            &job_name,
            JobStatus {
                succeeded: Some(1),
                ..Default::default()
            },
        );
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(cluster.status(&key).unwrap().phase, Phase::Succeeded);

        // TTL cleanup removes the Job; the resource stays Succeeded.
        cluster.delete_job(NS, &job_name);
        let outcome = reconciler.reconcile(&key).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(cluster.status(&key).unwrap().phase, Phase::Succeeded);
    }

    #[tokio::test]
    async fn exhausted_conflicts_defer() {
        let (cluster, reconciler) = setup();
        let key = cluster.apply(NS, "nightly", spec());
        cluster.inject_status_conflicts(10);

        let outcome = reconciler.reconcile(&key).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Deferred);
        assert!(cluster.status(&key).is_none());
        assert_eq!(cluster.job_creations(), 1);
    }

    #[tokio::test]
    async fn adopted_job_is_still_announced_once() {
        let (cluster, reconciler) = setup();
        let key = cluster.apply(NS, "nightly", spec());
        cluster.inject_status_conflicts(1);

        let outcome = reconciler.reconcile(&key).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { phase: Phase::Pending });
        assert_eq!(cluster.job_creations(), 1);
        assert_eq!(cluster.event_reasons(&key), vec!["JobCreated"]);
    }

    #[tokio::test]
    async fn job_left_by_an_earlier_run_is_announced_when_recorded() {
        let (cluster, reconciler) = setup();
        let key = cluster.apply(NS, "nightly", spec());
        let resource = cluster.resource(&key).unwrap();
        cluster.create_job(&manifest::build_job(&resource).unwrap()).await.unwrap();

        reconciler.reconcile(&key).await.unwrap();

        assert_eq!(cluster.jobs().len(), 1);
        assert_eq!(cluster.event_reasons(&key), vec!["JobCreated"]);
    }

    #[test]
    fn failed_status_keeps_the_first_completion_time() {
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        let current = PaymentJobStatus {
            phase: Phase::Failed,
            completion_time: Some(earlier),
            ..Default::default()
        };
        let next = failed(&current, None, "boom".to_string(), Some(1));
        assert_eq!(next.completion_time, Some(earlier));

        let fresh = failed(&PaymentJobStatus::default(), None, "boom".to_string(), Some(1));
        assert!(fresh.completion_time.is_some());
    }
}
