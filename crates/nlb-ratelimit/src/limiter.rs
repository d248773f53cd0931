//! Keyed collection of token buckets.

use crate::bucket::{BucketStats, TokenBucket};
use crate::error::{RateLimitError, RateLimitResult};
use nlb_core::config::RateLimitConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// What a check against a key with no configured bucket does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MissingBucketPolicy {
    /// Admit the request.
    Allow,
    /// Reject with [`RateLimitError::MissingPolicy`].
    RequireExplicit,
    /// Create a bucket with these parameters on first use.
    Lazy { capacity: f64, refill_rate: f64 },
}

type SharedBucket = Arc<Mutex<TokenBucket>>;

/// Token-bucket admission control keyed by protocol/target.
///
/// The map lock is held only to find or insert a bucket; the check itself
/// runs under that bucket's own mutex.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, SharedBucket>>,
    missing: MissingBucketPolicy,
    enabled: bool,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MissingBucketPolicy::Allow)
    }
}

impl RateLimiter {
    pub fn new(missing: MissingBucketPolicy) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            missing,
            enabled: true,
        }
    }

    /// Build a limiter from the `[rate_limit]` config section. The section
    /// is expected to have passed `NlbConfig::validate`.
    pub fn from_config(config: &RateLimitConfig) -> RateLimitResult<Self> {
        let missing = if config.require_explicit_policy {
            MissingBucketPolicy::RequireExplicit
        } else if let (Some(capacity), Some(refill_rate)) =
            (config.default_capacity, config.default_refill_rate)
        {
            MissingBucketPolicy::Lazy {
                capacity,
                refill_rate,
            }
        } else {
            MissingBucketPolicy::Allow
        };
        let mut limiter = Self::new(missing);
        limiter.enabled = config.enabled;
        for b in &config.buckets {
            limiter.add_bucket(&b.key, b.capacity, b.refill_rate)?;
        }
        Ok(limiter)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn missing_policy(&self) -> MissingBucketPolicy {
        self.missing
    }

    /// Install (or replace) the bucket for `key`. The new bucket starts full.
    pub fn add_bucket(&self, key: &str, capacity: f64, refill_rate: f64) -> RateLimitResult<()> {
        validate(key, capacity, refill_rate)?;
        let bucket = TokenBucket::new(capacity, refill_rate, Instant::now());
        self.write()
            .insert(key.to_string(), Arc::new(Mutex::new(bucket)));
        info!(key, capacity, refill_rate, "rate limit bucket configured");
        Ok(())
    }

    /// Remove the bucket for `key`. Returns whether one existed.
    pub fn remove_bucket(&self, key: &str) -> bool {
        let removed = self.write().remove(key).is_some();
        if removed {
            info!(key, "rate limit bucket removed");
        }
        removed
    }

    /// Admit one request for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1.0)
    }

    /// Admit a request costing `n` tokens for `key`.
    pub fn allow_n(&self, key: &str, n: f64) -> bool {
        self.check_at(key, n, Instant::now()).is_ok()
    }

    pub fn check(&self, key: &str, n: f64) -> RateLimitResult<()> {
        self.check_at(key, n, Instant::now())
    }

    /// Check `n` tokens against `key` as of `now`.
    pub fn check_at(&self, key: &str, n: f64, now: Instant) -> RateLimitResult<()> {
        if !n.is_finite() || n < 0.0 {
            return Err(RateLimitError::InvalidAmount(n));
        }
        if !self.enabled {
            return Ok(());
        }

        let Some(bucket) = self.bucket_for(key, now)? else {
            return Ok(());
        };
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.try_consume_at(n, now).map_err(|available| {
            debug!(key, requested = n, available, "rate limit exceeded");
            RateLimitError::Exceeded {
                key: key.to_string(),
                requested: n,
                available,
            }
        })
    }

    pub fn check_target(&self, protocol: &str, target: &str, n: f64) -> RateLimitResult<()> {
        self.check_target_at(protocol, target, n, Instant::now())
    }

    /// Check `n` tokens for one routing target of `protocol`. A bucket
    /// configured under [`target_key`] wins; otherwise the protocol-wide
    /// bucket (and its missing-bucket policy) applies.
    pub fn check_target_at(
        &self,
        protocol: &str,
        target: &str,
        n: f64,
        now: Instant,
    ) -> RateLimitResult<()> {
        let key = target_key(protocol, target);
        if self.read().contains_key(&key) {
            return self.check_at(&key, n, now);
        }
        self.check_at(protocol, n, now)
    }

    /// Find the bucket for `key`, applying the missing-bucket policy.
    /// `Ok(None)` means the request is admitted without a bucket.
    fn bucket_for(&self, key: &str, now: Instant) -> RateLimitResult<Option<SharedBucket>> {
        if let Some(b) = self.read().get(key) {
            return Ok(Some(b.clone()));
        }
        match self.missing {
            MissingBucketPolicy::Allow => Ok(None),
            MissingBucketPolicy::RequireExplicit => {
                Err(RateLimitError::MissingPolicy(key.to_string()))
            }
            MissingBucketPolicy::Lazy {
                capacity,
                refill_rate,
            } => {
                let mut buckets = self.write();
                let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
                    debug!(key, capacity, refill_rate, "created rate limit bucket on first use");
                    Arc::new(Mutex::new(TokenBucket::new(capacity, refill_rate, now)))
                });
                Ok(Some(bucket.clone()))
            }
        }
    }

    pub fn stats(&self, key: &str) -> Option<BucketStats> {
        let bucket = self.read().get(key)?.clone();
        let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        Some(bucket.stats_at(key, Instant::now()))
    }

    /// Stats for every bucket, sorted by key.
    pub fn all_stats(&self) -> Vec<BucketStats> {
        let now = Instant::now();
        let buckets: Vec<(String, SharedBucket)> = self
            .read()
            .iter()
            .map(|(k, b)| (k.clone(), b.clone()))
            .collect();
        let mut stats: Vec<BucketStats> = buckets
            .iter()
            .map(|(k, b)| {
                b.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .stats_at(k, now)
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SharedBucket>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SharedBucket>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bucket key for a single target of a protocol, e.g. `redis:cache-1`.
pub fn target_key(protocol: &str, target: &str) -> String {
    format!("{protocol}:{target}")
}

fn validate(key: &str, capacity: f64, refill_rate: f64) -> RateLimitResult<()> {
    let invalid = |reason: &str| RateLimitError::InvalidBucket {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("key must not be empty"));
    }
    if !capacity.is_finite() || capacity <= 0.0 {
        return Err(invalid("capacity must be positive"));
    }
    if !refill_rate.is_finite() || refill_rate < 0.0 {
        return Err(invalid("refill_rate must be a non-negative number"));
    }
    Ok(())
}
