//! nlb.toml configuration parser.
//!
//! Every section carries defaults, so an empty file is a valid
//! configuration. Durations are written as human strings (`"250ms"`,
//! `"30s"`, `"5m"`, `"1h"`) and parsed on access; [`NlbConfig::validate`]
//! parses all of them up front so a malformed value fails at startup.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{PressureWeights, Protocol};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest per-protocol minimum the inspector needs to classify anything.
pub const MIN_INSPECT_BYTES: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NlbConfig {
    pub server: ServerConfig,
    pub inspector: InspectorConfig,
    pub rate_limit: RateLimitConfig,
    pub autoscale: AutoscaleConfig,
    pub health: HealthConfig,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the L4 listener that receives client traffic.
    pub bind: String,
    /// Address of the registration/management HTTP API.
    pub api_bind: String,
    pub upstream_connect_timeout: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7400".to_string(),
            api_bind: "127.0.0.1:7401".to_string(),
            upstream_connect_timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub max_inspect_bytes: usize,
    pub classification_timeout: String,
    /// Protocol used for connections that classify as unknown. Unknown
    /// connections are dropped when unset.
    pub catch_all: Option<Protocol>,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            max_inspect_bytes: MIN_INSPECT_BYTES,
            classification_timeout: "2s".to_string(),
            catch_all: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Deny keys with no configured bucket instead of allowing them.
    pub require_explicit_policy: bool,
    /// When both defaults are set, unconfigured keys get a bucket created
    /// on first use.
    pub default_capacity: Option<f64>,
    pub default_refill_rate: Option<f64>,
    pub buckets: Vec<BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_explicit_policy: false,
            default_capacity: None,
            default_refill_rate: None,
            buckets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub key: String,
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub interval: String,
    pub history_limit: usize,
    pub policies: Vec<PolicyConfig>,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "30s".to_string(),
            history_limit: 100,
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub protocol: Protocol,
    pub min_instances: u32,
    pub max_instances: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown: String,
    pub evaluation_window: usize,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
    pub target_connections_per_instance: u64,
    pub weights: PressureWeights,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            min_instances: 1,
            max_instances: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown: "3m".to_string(),
            evaluation_window: 3,
            scale_up_step: 1,
            scale_down_step: 1,
            target_connections_per_instance: 1000,
            weights: PressureWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Heartbeat silence after which an instance counts as having missed
    /// one heartbeat and is marked unhealthy.
    pub heartbeat_timeout: String,
    /// Consecutive missed heartbeats after which the instance is removed.
    pub max_missed_heartbeats: u32,
    pub sweep_interval: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: "15s".to_string(),
            max_missed_heartbeats: 3,
            sweep_interval: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub history_limit: usize,
    pub deployments: Vec<DeploymentSeed>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            deployments: Vec::new(),
        }
    }
}

/// Blue/green versions registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSeed {
    pub protocol: Protocol,
    pub blue: String,
    pub green: String,
    /// Canary schedule started immediately after initialization.
    #[serde(default)]
    pub canary_steps: Option<Vec<u8>>,
}

impl NlbConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        parse_duration(&self.server.upstream_connect_timeout)?;
        parse_duration(&self.inspector.classification_timeout)?;
        parse_duration(&self.autoscale.interval)?;
        parse_duration(&self.health.sweep_interval)?;
        if parse_duration(&self.health.heartbeat_timeout)?.is_zero() {
            return Err(invalid("health.heartbeat_timeout must be non-zero"));
        }
        if self.health.max_missed_heartbeats == 0 {
            return Err(invalid("health.max_missed_heartbeats must be at least 1"));
        }

        if self.inspector.max_inspect_bytes < MIN_INSPECT_BYTES {
            return Err(invalid(format!(
                "inspector.max_inspect_bytes must be at least {MIN_INSPECT_BYTES}, got {}",
                self.inspector.max_inspect_bytes
            )));
        }

        for b in &self.rate_limit.buckets {
            validate_bucket(&b.key, b.capacity, b.refill_rate)?;
        }
        if let (Some(capacity), Some(refill)) = (
            self.rate_limit.default_capacity,
            self.rate_limit.default_refill_rate,
        ) {
            validate_bucket("<default>", capacity, refill)?;
        }

        for p in &self.autoscale.policies {
            p.validate()?;
        }

        for d in &self.rollout.deployments {
            if d.blue == d.green {
                return Err(invalid(format!(
                    "deployment {}: blue and green versions must differ",
                    d.protocol
                )));
            }
            if let Some(steps) = &d.canary_steps {
                validate_canary_steps(steps)
                    .map_err(|msg| invalid(format!("deployment {}: {msg}", d.protocol)))?;
            }
        }

        Ok(())
    }
}

impl PolicyConfig {
    pub fn cooldown(&self) -> ConfigResult<Duration> {
        parse_duration(&self.cooldown)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let p = self.protocol;
        self.cooldown()?;
        if self.min_instances > self.max_instances {
            return Err(invalid(format!(
                "policy {p}: min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if !self.scale_up_threshold.is_finite() || !self.scale_down_threshold.is_finite() {
            return Err(invalid(format!("policy {p}: thresholds must be finite")));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(invalid(format!(
                "policy {p}: scale_down_threshold must be below scale_up_threshold"
            )));
        }
        if self.evaluation_window == 0 {
            return Err(invalid(format!("policy {p}: evaluation_window must be at least 1")));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(invalid(format!("policy {p}: scale steps must be at least 1")));
        }
        if self.target_connections_per_instance == 0 {
            return Err(invalid(format!(
                "policy {p}: target_connections_per_instance must be at least 1"
            )));
        }
        Ok(())
    }
}

fn validate_bucket(key: &str, capacity: f64, refill_rate: f64) -> ConfigResult<()> {
    if !capacity.is_finite() || capacity <= 0.0 {
        return Err(invalid(format!("bucket {key}: capacity must be positive")));
    }
    if !refill_rate.is_finite() || refill_rate < 0.0 {
        return Err(invalid(format!(
            "bucket {key}: refill_rate must be a non-negative number"
        )));
    }
    Ok(())
}

/// Canary steps are green percentages in 1..=100, strictly increasing.
pub fn validate_canary_steps(steps: &[u8]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("canary steps must not be empty".to_string());
    }
    let mut prev = 0u8;
    for &s in steps {
        if s == 0 || s > 100 {
            return Err(format!("canary step {s} outside 1..=100"));
        }
        if s <= prev {
            return Err("canary steps must be strictly increasing".to_string());
        }
        prev = s;
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Parse a human duration: `250ms`, `30s`, `5m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let bad = || ConfigError::InvalidDuration(s.to_string());
    let (num, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = num.trim().parse().map_err(|_| bad())?;
    let ms = value.checked_mul(unit_ms).ok_or_else(bad)?;
    Ok(Duration::from_millis(ms))
}

/// Accessors that parse the string durations of the config sections.
macro_rules! duration_accessor {
    ($ty:ty, $($field:ident),+) => {
        impl $ty {
            $(
                pub fn $field(&self) -> ConfigResult<Duration> {
                    parse_duration(&self.$field)
                }
            )+
        }
    };
}

duration_accessor!(ServerConfig, upstream_connect_timeout);
duration_accessor!(InspectorConfig, classification_timeout);
duration_accessor!(AutoscaleConfig, interval);
duration_accessor!(HealthConfig, heartbeat_timeout, sweep_interval);
