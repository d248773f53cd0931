//! Registry change notifications.
//!
//! Published on a broadcast channel so downstream configuration pushers
//! can follow registry changes without polling. Events are best-effort:
//! a slow subscriber that lags simply misses events.

use nlb_core::{HealthStatus, Protocol};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEvent {
    /// Epoch milliseconds.
    pub at: u64,
    #[serde(flatten)]
    pub kind: RegistryEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEventKind {
    Registered {
        instance_id: String,
        protocol: Protocol,
        address: String,
        version: String,
    },
    Unregistered {
        instance_id: String,
        protocol: Protocol,
        reason: RemovalReason,
    },
    HealthChanged {
        instance_id: String,
        protocol: Protocol,
        from: HealthStatus,
        to: HealthStatus,
    },
    WeightsChanged {
        protocol: Protocol,
        /// `(version, weight)` pairs.
        weights: Vec<(String, u8)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Non-graceful unregister.
    Unregistered,
    /// Graceful unregister completed after the last connection closed.
    Drained,
    /// Too many consecutive missed heartbeats.
    HeartbeatTimeout,
}
