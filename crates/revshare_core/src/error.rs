//! crates/revshare_core/src/error.rs
//!
//! The error type returned by every service operation in the core.
//!
//! Low fraud scores, duplicate webhook deliveries and failed transfers are
//! normal outcomes and never surface through this type.

use uuid::Uuid;

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed or out-of-range input, rejected before anything is persisted.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A state-machine transition that is not allowed from the current state.
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage or collaborator failure propagated from a port.
    #[error("Port error: {0}")]
    Port(PortError),
}

impl From<PortError> for ServiceError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Port(other),
        }
    }
}

/// A convenience type alias for `Result<T, ServiceError>`.
pub type ServiceResult<T> = Result<T, ServiceError>;

pub(crate) fn invalid(msg: impl Into<String>) -> ServiceError {
    ServiceError::InvalidInput(msg.into())
}
