//! Token-bucket rate limiting.
//!
//! Buckets refill lazily on each check; there is no background timer.
//! Each bucket sits behind its own mutex so checks on different keys
//! never contend.

pub mod bucket;
pub mod error;
pub mod limiter;

pub use bucket::{BucketStats, TokenBucket};
pub use error::{RateLimitError, RateLimitResult};
pub use limiter::{MissingBucketPolicy, RateLimiter, target_key};
