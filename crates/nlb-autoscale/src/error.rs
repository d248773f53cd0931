use nlb_core::Protocol;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for autoscaler operations.
pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutoscaleError {
    #[error("no scaling policy for {0}")]
    UnknownPolicy(Protocol),

    #[error("invalid scaling policy: {0}")]
    InvalidPolicy(String),

    #[error("scaling {protocol} to {target} violates bounds [{min}, {max}]")]
    PolicyViolation {
        protocol: Protocol,
        target: u32,
        min: u32,
        max: u32,
    },

    #[error("{protocol} is cooling down for another {remaining:?}")]
    CoolingDown {
        protocol: Protocol,
        remaining: Duration,
    },

    #[error("{protocol} already runs {instances} instances")]
    NoChange { protocol: Protocol, instances: u32 },
}
