//! nlb-metrics — counters for the load balancer's telemetry sink.
//!
//! # Architecture
//!
//! ```text
//! NlbMetrics
//!   ├── record_*()  ← data path (accept loop) and management API
//!   └── report()    → MetricsReport, served at /api/v1/stats
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{MetricsReport, NlbMetrics, ProtocolCounters};
pub use prometheus::{Exposition, render_prometheus};
