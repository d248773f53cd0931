use thiserror::Error;

/// Result type alias for inspection.
pub type InspectResult<T> = Result<T, InspectError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InspectError {
    /// Not enough bytes to decide. Buffer more and retry.
    #[error("classification incomplete: have {available} bytes, need {required}")]
    Incomplete { available: usize, required: usize },

    /// No detector matched.
    #[error("unknown protocol")]
    Unknown,
}

impl InspectError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, InspectError::Incomplete { .. })
    }
}
