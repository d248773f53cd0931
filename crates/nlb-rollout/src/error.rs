use nlb_core::Protocol;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RolloutError {
    #[error("no deployment initialized for {0}")]
    NotInitialized(Protocol),

    #[error("invalid weight configuration: blue={blue} green={green} (must sum to 100)")]
    InvalidWeightConfiguration { blue: u8, green: u8 },

    #[error("version {version} is not deployed for {protocol}")]
    UnknownVersion { protocol: Protocol, version: String },

    #[error("invalid versions: {0}")]
    InvalidVersions(String),

    #[error("invalid canary steps: {0}")]
    InvalidSteps(String),

    #[error("deployment for {0} is already transitioning")]
    AlreadyTransitioning(Protocol),

    #[error("deployment for {0} has no canary step to promote")]
    NotTransitioning(Protocol),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
