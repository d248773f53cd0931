use thiserror::Error;

/// Result type alias for rate limiter operations.
pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {key}: requested {requested}, available {available:.3}")]
    Exceeded {
        key: String,
        requested: f64,
        available: f64,
    },

    #[error("no rate limit policy configured for {0}")]
    MissingPolicy(String),

    #[error("invalid bucket {key}: {reason}")]
    InvalidBucket { key: String, reason: String },

    #[error("invalid token request: {0}")]
    InvalidAmount(f64),
}
