use cluster::{ClusterError, EnvError};

use crate::ports::NoAvailablePortsError;

/// Service-level error taxonomy; the HTTP layer maps kinds to status
/// codes.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("no available ports")]
    NoAvailablePorts,

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl From<NoAvailablePortsError> for ServiceError {
    fn from(_: NoAvailablePortsError) -> Self {
        Self::NoAvailablePorts
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
