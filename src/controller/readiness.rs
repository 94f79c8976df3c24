//! Readiness Evaluator
//!
//! Point-in-time classification of a workload as ready, not ready but worth
//! re-polling (retriable), or stalled/malformed (fatal). Never waits.
//!
//! Check order:
//! 1. `status.observedGeneration` missing: fatal, not a well-formed workload
//! 2. `metadata.generation > observedGeneration`: retriable
//! 3. Deployment only: Progressing reason `ProgressDeadlineExceeded`: fatal
//! 4. updated < desired: retriable, unless Available=False with reason
//!    `MinimumReplicasUnavailable` has lasted longer than the deadline
//! 5. total > updated: retriable (old replicas terminating)
//! 6. available < updated: retriable
//!
//! Generic kinds have no stall condition, so step 3 never applies to them.

use crate::controller::workload::WorkloadView;
use chrono::{DateTime, Duration, Utc};
use kube::core::DynamicObject;

/// Progressing condition reason set once a Deployment passed its deadline
pub const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Available condition reason while below minimum availability
pub const MINIMUM_REPLICAS_UNAVAILABLE: &str = "MinimumReplicasUnavailable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ready,
    NotReady { retriable: bool, reason: String },
}

impl Verdict {
    pub fn is_ready(&self) -> bool {
        matches!(self, Verdict::Ready)
    }

    /// Ready counts as retriable: there is nothing to give up on
    pub fn is_retriable(&self) -> bool {
        match self {
            Verdict::Ready => true,
            Verdict::NotReady { retriable, .. } => *retriable,
        }
    }

    fn retry(reason: String) -> Self {
        Verdict::NotReady {
            retriable: true,
            reason,
        }
    }

    fn fatal(reason: String) -> Self {
        Verdict::NotReady {
            retriable: false,
            reason,
        }
    }
}

/// Evaluate a workload against a progress deadline in seconds
pub fn evaluate(obj: &DynamicObject, deadline_seconds: i32, now: DateTime<Utc>) -> Verdict {
    let view = WorkloadView::new(obj);

    let Some(observed) = view.observed_generation() else {
        return Verdict::fatal(format!(
            "kind:{} is not a well-formed workload, status.observedGeneration not found",
            view.kind()
        ));
    };

    if view.generation() > observed {
        return Verdict::retry(
            "waiting for rollout to finish: observed generation behind desired generation"
                .to_string(),
        );
    }

    if view.has_rich_conditions() {
        if let Some(progressing) = view.condition("Progressing") {
            if progressing.reason.as_deref() == Some(PROGRESS_DEADLINE_EXCEEDED) {
                return Verdict::fatal(format!(
                    "{} {:?} exceeded its progress deadline",
                    view.kind().to_lowercase(),
                    view.name()
                ));
            }
        }
    }

    // Typed kinds omit zero-valued counters; generic kinds must publish them
    let (total, updated) = if view.has_typed_status() {
        (
            view.status_replicas().unwrap_or(0),
            view.updated_replicas().unwrap_or(0),
        )
    } else {
        let Some(total) = view.status_replicas() else {
            return malformed(&view, "status.replicas");
        };
        let Some(updated) = view.updated_replicas() else {
            return malformed(&view, "status.updatedReplicas");
        };
        (total, updated)
    };
    let available = if view.has_typed_status() {
        Some(view.available_replicas().unwrap_or(0))
    } else {
        view.available_replicas()
    };

    if let Some(desired) = view.desired_replicas() {
        if updated < desired {
            let reason = format!(
                "waiting for rollout to finish: {} out of {} new replicas have been updated",
                updated, desired
            );
            if is_stalled(&view, deadline_seconds, now) {
                return Verdict::fatal(reason);
            }
            return Verdict::retry(reason);
        }
    }

    if total > updated {
        return Verdict::retry(format!(
            "waiting for rollout to finish: {} old replicas are pending termination",
            total - updated
        ));
    }

    if let Some(available) = available {
        if available < updated {
            return Verdict::retry(format!(
                "waiting for rollout to finish: {} of {} updated replicas are available",
                available, updated
            ));
        }
    }

    Verdict::Ready
}

/// Stuck below minimum availability for longer than the deadline
fn is_stalled(view: &WorkloadView<'_>, deadline_seconds: i32, now: DateTime<Utc>) -> bool {
    if !view.has_rich_conditions() {
        return false;
    }
    let Some(available) = view.condition("Available") else {
        return false;
    };
    if available.status != "False"
        || available.reason.as_deref() != Some(MINIMUM_REPLICAS_UNAVAILABLE)
    {
        return false;
    }
    match available.changed_at() {
        Some(since) => since + Duration::seconds(i64::from(deadline_seconds)) < now,
        None => false,
    }
}

fn malformed(view: &WorkloadView<'_>, field: &str) -> Verdict {
    Verdict::fatal(format!(
        "kind:{} is not a well-formed workload, {} not found",
        view.kind(),
        field
    ))
}

#[cfg(test)]
#[path = "readiness_test.rs"]
mod tests;
