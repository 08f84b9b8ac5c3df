//! Job status → `PaymentJob` phase.
//!
//! Pure. The reconciler applies the result only when
//! [`Phase::can_advance_to`] allows it.

use k8s_openapi::api::batch::v1::Job;

use paymentjob_core::Phase;

/// Kubernetes default when a Job leaves `backoffLimit` unset.
pub const DEFAULT_BACKOFF_LIMIT: i32 = 6;

/// The parts of a Job's spec and status the projection depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitCondition {
    pub started: bool,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub backoff_limit: i32,
    pub complete: bool,
    /// Set when the Job carries `Failed=True`; holds the condition message if any.
    pub failed_condition: Option<Option<String>>,
}

impl UnitCondition {
    pub fn from_job(job: &Job) -> Self {
        let backoff_limit = job
            .spec
            .as_ref()
            .and_then(|s| s.backoff_limit)
            .unwrap_or(DEFAULT_BACKOFF_LIMIT);
        let Some(status) = job.status.as_ref() else {
            return Self {
                backoff_limit,
                ..Default::default()
            };
        };

        let conditions = status.conditions.as_deref().unwrap_or_default();
        let is_true = |kind: &str| {
            conditions
                .iter()
                .find(|c| c.type_ == kind && c.status == "True")
        };

        let active = status.active.unwrap_or(0);
        let succeeded = status.succeeded.unwrap_or(0);
        let failed = status.failed.unwrap_or(0);
        Self {
            started: status.start_time.is_some() || active > 0 || succeeded > 0 || failed > 0,
            active,
            succeeded,
            failed,
            backoff_limit,
            complete: is_true("Complete").is_some(),
            failed_condition: is_true("Failed").map(|c| c.message.clone()),
        }
    }

    fn retries_exhausted(&self) -> bool {
        self.failed >= self.backoff_limit.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub phase: Phase,
    pub message: Option<String>,
}

impl Projection {
    fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
        }
    }
}

/// Map a Job condition to a phase, falling back to `previous`.
pub fn project(previous: Phase, unit: &UnitCondition) -> Projection {
    if !unit.started {
        return Projection::new(Phase::Pending, "Waiting for pod to start");
    }
    if unit.succeeded > 0 || unit.complete {
        return Projection::new(Phase::Succeeded, "Job completed successfully");
    }
    if let Some(message) = &unit.failed_condition {
        let message = message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "Job failed".to_string());
        return Projection::new(Phase::Failed, message);
    }
    if unit.retries_exhausted() {
        return Projection::new(
            Phase::Failed,
            format!("Job failed after {} attempt(s)", unit.failed),
        );
    }
    if unit.active > 0 {
        return Projection::new(
            Phase::Running,
            format!("Job is running ({} active pod(s))", unit.active),
        );
    }
    Projection {
        phase: previous,
        message: None,
    }
}
