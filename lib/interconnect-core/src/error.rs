use thiserror::Error;

pub type Result<T> = std::result::Result<T, ValidationError>;

/// A deployment plan that cannot be turned into a desired state.
///
/// Validation errors are terminal until the Interconnect spec changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid placement '{0}': expected one of Any, Every")]
    InvalidPlacement(String),

    #[error("Invalid role '{0}': expected one of interior, edge")]
    InvalidRole(String),

    #[error("Invalid size {0}: must be zero or greater")]
    NegativeSize(i32),

    #[error("Invalid liveness port {0}: must be between 1 and 65535")]
    InvalidLivenessPort(i32),

    #[error("Invalid service type '{0}': expected one of ClusterIP, NodePort, LoadBalancer")]
    InvalidServiceType(String),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),
}
