//! Lock-free counters. One slot per protocol plus a handful of globals.

use nlb_core::Protocol;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Slot {
    routed: AtomicU64,
    routing_errors: AtomicU64,
    rate_limit_allowed: AtomicU64,
    rate_limit_denied: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    deployment_transitions: AtomicU64,
    rollbacks: AtomicU64,
}

/// Point-in-time counter values for one protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolCounters {
    pub protocol: Protocol,
    pub routed: u64,
    pub routing_errors: u64,
    pub rate_limit_allowed: u64,
    pub rate_limit_denied: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub deployment_transitions: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    pub connections_accepted: u64,
    pub classification_unknown: u64,
    pub classification_timeouts: u64,
    pub protocols: Vec<ProtocolCounters>,
}

/// Process-wide telemetry counters. Cheap to update from any task.
#[derive(Default)]
pub struct NlbMetrics {
    accepted: AtomicU64,
    unknown: AtomicU64,
    timeouts: AtomicU64,
    slots: [Slot; Protocol::ALL.len()],
}

impl NlbMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, protocol: Protocol) -> &Slot {
        &self.slots[protocol as usize]
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection whose prefix matched no known signature.
    pub fn record_unknown_protocol(&self) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection that stayed incomplete until the classification
    /// deadline.
    pub fn record_classification_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self, protocol: Protocol) {
        self.slot(protocol).routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routing_error(&self, protocol: Protocol) {
        self.slot(protocol)
            .routing_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit(&self, protocol: Protocol, allowed: bool) {
        let slot = self.slot(protocol);
        if allowed {
            slot.rate_limit_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.rate_limit_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_bytes(&self, protocol: Protocol, to_upstream: u64, to_client: u64) {
        let slot = self.slot(protocol);
        slot.bytes_to_upstream
            .fetch_add(to_upstream, Ordering::Relaxed);
        slot.bytes_to_client.fetch_add(to_client, Ordering::Relaxed);
    }

    pub fn record_scaling_event(&self, protocol: Protocol, scale_up: bool) {
        let slot = self.slot(protocol);
        if scale_up {
            slot.scale_ups.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.scale_downs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deployment_transition(&self, protocol: Protocol, rollback: bool) {
        let slot = self.slot(protocol);
        slot.deployment_transitions
            .fetch_add(1, Ordering::Relaxed);
        if rollback {
            slot.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counters(&self, protocol: Protocol) -> ProtocolCounters {
        let s = self.slot(protocol);
        ProtocolCounters {
            protocol,
            routed: s.routed.load(Ordering::Relaxed),
            routing_errors: s.routing_errors.load(Ordering::Relaxed),
            rate_limit_allowed: s.rate_limit_allowed.load(Ordering::Relaxed),
            rate_limit_denied: s.rate_limit_denied.load(Ordering::Relaxed),
            bytes_to_upstream: s.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: s.bytes_to_client.load(Ordering::Relaxed),
            scale_ups: s.scale_ups.load(Ordering::Relaxed),
            scale_downs: s.scale_downs.load(Ordering::Relaxed),
            deployment_transitions: s.deployment_transitions.load(Ordering::Relaxed),
            rollbacks: s.rollbacks.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            classification_unknown: self.unknown.load(Ordering::Relaxed),
            classification_timeouts: self.timeouts.load(Ordering::Relaxed),
            protocols: Protocol::ALL.iter().map(|&p| self.counters(p)).collect(),
        }
    }
}
