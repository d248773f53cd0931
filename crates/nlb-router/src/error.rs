use nlb_core::Protocol;
use thiserror::Error;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("no backend available for {0}")]
    NoBackendAvailable(Protocol),

    #[error("instance {instance_id} is already registered for {existing}")]
    DuplicateRegistration {
        instance_id: String,
        existing: Protocol,
    },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}
