//! Interconnect status and the Ready condition

use interconnect_api::{Condition, InterconnectStatus};

pub const READY: &str = "Ready";

pub const REASON_CONVERGED: &str = "Converged";
pub const REASON_TRANSITIONING: &str = "Transitioning";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_OWNERSHIP_CONFLICT: &str = "OwnershipConflict";

/// Outcome of a pass, as reflected in the Ready condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Converged { message: String },
    Transitioning { message: String },
    ValidationFailed { message: String },
    OwnershipConflict { message: String },
}

impl Readiness {
    fn parts(&self) -> (&'static str, &'static str, &str) {
        match self {
            Readiness::Converged { message } => ("True", REASON_CONVERGED, message),
            Readiness::Transitioning { message } => ("False", REASON_TRANSITIONING, message),
            Readiness::ValidationFailed { message } => {
                ("False", REASON_VALIDATION_FAILED, message)
            }
            Readiness::OwnershipConflict { message } => {
                ("False", REASON_OWNERSHIP_CONFLICT, message)
            }
        }
    }
}

/// Compute the next status from the previous one.
///
/// The Ready condition keeps its previous transition time unless its status
/// or reason changes, so recomputing an unchanged outcome yields an equal
/// status and no write is needed.
pub fn next_status(
    previous: &InterconnectStatus,
    readiness: &Readiness,
    pod_names: Vec<String>,
    workload_kind: Option<&str>,
    generation: Option<i64>,
    now: &str,
) -> InterconnectStatus {
    let (status, reason, message) = readiness.parts();

    let last_transition_time = match previous.condition(READY) {
        Some(prev) if prev.status == status && prev.reason.as_deref() == Some(reason) => {
            prev.last_transition_time.clone()
        }
        _ => Some(now.to_string()),
    };

    let ready = Condition {
        condition_type: READY.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time,
    };

    let mut conditions: Vec<Condition> = previous
        .conditions
        .iter()
        .filter(|c| c.condition_type != READY)
        .cloned()
        .collect();
    conditions.push(ready);

    let mut pod_names = pod_names;
    pod_names.sort();

    InterconnectStatus {
        conditions,
        pod_names,
        workload_kind: workload_kind.map(String::from),
        observed_generation: generation,
    }
}
