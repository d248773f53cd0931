//! Scaling policies, samples, and the pressure function.

use crate::error::{AutoscaleError, AutoscaleResult};
use nlb_core::config::PolicyConfig;
use nlb_core::{MetricsSnapshot, PressureWeights, Protocol};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Maps a sample to a pressure value comparable against the policy
/// thresholds.
pub type PressureFn = Arc<dyn Fn(&ScalingMetricsSample, &ScalingPolicy) -> f64 + Send + Sync>;

/// Validated scaling policy for one protocol's module pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub protocol: Protocol,
    pub min_instances: u32,
    pub max_instances: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown: Duration,
    /// Number of samples that must all agree before a directive fires.
    pub evaluation_window: usize,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
    pub target_connections_per_instance: u64,
    pub weights: PressureWeights,
}

impl ScalingPolicy {
    pub fn from_config(config: &PolicyConfig) -> AutoscaleResult<Self> {
        config
            .validate()
            .map_err(|e| AutoscaleError::InvalidPolicy(e.to_string()))?;
        let cooldown = config
            .cooldown()
            .map_err(|e| AutoscaleError::InvalidPolicy(e.to_string()))?;
        Ok(Self {
            protocol: config.protocol,
            min_instances: config.min_instances,
            max_instances: config.max_instances,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            cooldown,
            evaluation_window: config.evaluation_window,
            scale_up_step: config.scale_up_step,
            scale_down_step: config.scale_down_step,
            target_connections_per_instance: config.target_connections_per_instance,
            weights: config.weights,
        })
    }
}

/// One evaluation-window sample: a protocol's metrics folded across the
/// instances that reported since the previous tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScalingMetricsSample {
    /// Epoch milliseconds.
    pub at: u64,
    /// Mean across reporting instances.
    pub cpu_percent: f64,
    /// Mean across reporting instances.
    pub memory_percent: f64,
    /// Sum across reporting instances.
    pub connections: u64,
    /// Mean across reporting instances.
    pub latency_ms: f64,
    /// Instances in the pool when the sample was taken.
    pub instances: u32,
}

impl ScalingMetricsSample {
    /// Fold per-instance snapshots into one sample.
    pub fn aggregate<'a>(
        snapshots: impl IntoIterator<Item = &'a MetricsSnapshot>,
        instances: u32,
        at: u64,
    ) -> Option<Self> {
        let mut n = 0u32;
        let mut sample = Self {
            at,
            instances,
            ..Default::default()
        };
        for s in snapshots {
            n += 1;
            sample.cpu_percent += s.cpu_percent;
            sample.memory_percent += s.memory_percent;
            sample.connections += s.active_connections;
            sample.latency_ms += s.latency_ms;
        }
        if n == 0 {
            return None;
        }
        let n = f64::from(n);
        sample.cpu_percent /= n;
        sample.memory_percent /= n;
        sample.latency_ms /= n;
        Some(sample)
    }
}

/// Weighted mean of CPU, memory, and connection utilization, each
/// normalized so that 1.0 means fully loaded.
pub fn default_pressure(sample: &ScalingMetricsSample, policy: &ScalingPolicy) -> f64 {
    let w = policy.weights;
    let total = w.cpu + w.memory + w.connections;
    if total <= 0.0 {
        return 0.0;
    }
    let capacity =
        f64::from(sample.instances.max(1)) * policy.target_connections_per_instance.max(1) as f64;
    let cpu = sample.cpu_percent / 100.0;
    let memory = sample.memory_percent / 100.0;
    let connections = sample.connections as f64 / capacity;
    (w.cpu * cpu + w.memory * memory + w.connections * connections) / total
}
