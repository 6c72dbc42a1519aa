use crate::cluster::ClusterError;
use interconnect_core::ValidationError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single reconciliation pass
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{kind} {namespace}/{name} exists but is not controlled by this Interconnect")]
    OwnershipConflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Reconciliation pass exceeded {0:?}")]
    Timeout(Duration),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Whether requeueing with backoff can fix this error without a spec change
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Cluster(_) | ReconcileError::Timeout(_))
    }
}
