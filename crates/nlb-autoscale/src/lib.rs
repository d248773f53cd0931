//! nlb-autoscale — windowed, cooldown-guarded scaling directives.
//!
//! Modules stream metrics through their heartbeats. On every tick the
//! autoscaler folds each policy's fresh metrics into one sample, keeps the
//! last `evaluation_window` samples in a ring, and decides.
//!
//! # Scaling Algorithm
//!
//! ```text
//! pressure(sample) = configurable; default weighted mean of
//!                      cpu% / 100
//!                      memory% / 100
//!                      connections / (instances * target_connections_per_instance)
//!
//! Stable ──tick with new samples──▶ Evaluating
//!   every sample in window > scale_up_threshold and instances < max:
//!       ScaleUp(min(instances + scale_up_step, max))      ──▶ Cooldown
//!   every sample in window < scale_down_threshold and instances > min:
//!       ScaleDown(max(instances - scale_down_step, min))  ──▶ Cooldown
//!   otherwise                                             ──▶ Stable
//! Cooldown ──cooldown elapsed──▶ Stable
//! ```
//!
//! Samples keep accumulating during cooldown but cannot trigger a
//! directive. Directives are advisory: they are handed to a
//! [`ScaleCallback`] and recorded in a bounded history.

pub mod error;
pub mod policy;
pub mod scaler;

pub use error::{AutoscaleError, AutoscaleResult};
pub use policy::{PressureFn, ScalingMetricsSample, ScalingPolicy, default_pressure};
pub use scaler::{
    Autoscaler, PolicyState, PolicyStats, ScaleCallback, ScaleDirection, ScaleDirective,
    ScalingEvent, ScalingEventKind, TriggerSource,
};
