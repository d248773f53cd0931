//! Registry entries.
//!
//! An entry splits into immutable identity, a small lock-protected block
//! of descriptive fields that only change on re-registration or
//! heartbeat, and independent atomics for everything the hot path reads
//! or writes.

use nlb_core::{HealthStatus, InstanceId, MetricsSnapshot, Protocol};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Weight an endpoint carries when no blue/green split covers its version.
pub const DEFAULT_TRAFFIC_WEIGHT: u8 = 100;

/// Registration request sent by a module instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub instance_id: InstanceId,
    pub protocol: Protocol,
    /// `host:port` the load balancer forwards connections to.
    pub address: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub initial_routes: Vec<String>,
    /// Concurrent connection cap. `None` means unbounded.
    #[serde(default)]
    pub max_connections: Option<u64>,
}

impl Registration {
    pub fn new(instance_id: &str, protocol: Protocol, address: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            protocol,
            address: address.to_string(),
            version: String::new(),
            initial_routes: Vec::new(),
            max_connections: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_max_connections(mut self, max: u64) -> Self {
        self.max_connections = Some(max);
        self
    }
}

/// Snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEndpoint {
    pub instance_id: InstanceId,
    pub protocol: Protocol,
    pub address: String,
    pub version: String,
    pub initial_routes: Vec<String>,
    pub health_status: HealthStatus,
    pub current_connections: u64,
    pub total_connections: u64,
    pub max_connections: Option<u64>,
    pub traffic_weight: u8,
    pub draining: bool,
    /// Epoch milliseconds of the last heartbeat (registration counts as one).
    pub last_heartbeat: u64,
    pub missed_heartbeats: u32,
    pub registered_at: u64,
    pub last_metrics: Option<MetricsSnapshot>,
}

#[derive(Debug, Clone)]
pub(crate) struct EndpointMeta {
    pub address: String,
    pub version: String,
    pub initial_routes: Vec<String>,
    pub max_connections: Option<u64>,
    pub last_metrics: Option<MetricsSnapshot>,
}

#[derive(Debug)]
pub(crate) struct EndpointEntry {
    pub instance_id: InstanceId,
    pub protocol: Protocol,
    pub registered_at: u64,
    meta: RwLock<EndpointMeta>,
    health: AtomicU8,
    connections: AtomicU64,
    total: AtomicU64,
    /// Mirrors `meta.max_connections` for lock-free admission; 0 = unbounded.
    max_connections: AtomicU64,
    traffic_weight: AtomicU8,
    last_heartbeat: AtomicU64,
    missed: AtomicU32,
    draining: AtomicBool,
    removed: AtomicBool,
}

impl EndpointEntry {
    pub fn new(reg: &Registration, weight: u8, now_ms: u64) -> Self {
        Self {
            instance_id: reg.instance_id.clone(),
            protocol: reg.protocol,
            registered_at: now_ms,
            meta: RwLock::new(EndpointMeta {
                address: reg.address.clone(),
                version: reg.version.clone(),
                initial_routes: reg.initial_routes.clone(),
                max_connections: reg.max_connections,
                last_metrics: None,
            }),
            health: AtomicU8::new(HealthStatus::Healthy.as_u8()),
            connections: AtomicU64::new(0),
            total: AtomicU64::new(0),
            max_connections: AtomicU64::new(reg.max_connections.unwrap_or(0)),
            traffic_weight: AtomicU8::new(weight),
            last_heartbeat: AtomicU64::new(now_ms),
            missed: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> EndpointMeta {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> String {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
            .clone()
    }

    pub fn address(&self) -> String {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .address
            .clone()
    }

    /// Apply a re-registration in place. Counters are preserved.
    pub fn update(&self, reg: &Registration, now_ms: u64) {
        {
            let mut meta = self.meta.write().unwrap_or_else(PoisonError::into_inner);
            meta.address = reg.address.clone();
            meta.version = reg.version.clone();
            meta.initial_routes = reg.initial_routes.clone();
            meta.max_connections = reg.max_connections;
        }
        self.max_connections
            .store(reg.max_connections.unwrap_or(0), Ordering::Release);
        self.draining.store(false, Ordering::Release);
        self.missed.store(0, Ordering::Release);
        self.last_heartbeat.store(now_ms, Ordering::Release);
    }

    pub fn set_metrics(&self, metrics: MetricsSnapshot) {
        self.meta
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_metrics = Some(metrics);
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Store a new status and return the previous one.
    pub fn set_health(&self, status: HealthStatus) -> HealthStatus {
        HealthStatus::from_u8(self.health.swap(status.as_u8(), Ordering::AcqRel))
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    pub fn total_connections(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Reserve one connection slot unless the entry is at capacity.
    pub fn try_acquire(&self) -> bool {
        let max = self.max_connections.load(Ordering::Acquire);
        let acquired = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (max == 0 || c < max).then_some(c + 1)
            })
            .is_ok();
        if acquired {
            self.total.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Release one connection slot. Returns the remaining count. Never
    /// goes below zero.
    pub fn release(&self) -> u64 {
        match self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    pub fn at_capacity(&self) -> bool {
        let max = self.max_connections.load(Ordering::Acquire);
        max != 0 && self.connections() >= max
    }

    pub fn traffic_weight(&self) -> u8 {
        self.traffic_weight.load(Ordering::Acquire)
    }

    pub fn set_traffic_weight(&self, weight: u8) {
        self.traffic_weight.store(weight, Ordering::Release);
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Acquire)
    }

    /// Record a heartbeat and return the previous heartbeat time.
    pub fn touch(&self, now_ms: u64) -> u64 {
        self.missed.store(0, Ordering::Release);
        self.last_heartbeat.swap(now_ms, Ordering::AcqRel)
    }

    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }

    pub fn set_missed(&self, missed: u32) {
        self.missed.store(missed, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Eligible for selection, ignoring capacity.
    pub fn selectable(&self) -> bool {
        !self.is_draining() && !self.is_removed() && self.health().is_routable()
    }

    pub fn snapshot(&self) -> ModuleEndpoint {
        let meta = self.meta();
        ModuleEndpoint {
            instance_id: self.instance_id.clone(),
            protocol: self.protocol,
            address: meta.address,
            version: meta.version,
            initial_routes: meta.initial_routes,
            health_status: self.health(),
            current_connections: self.connections(),
            total_connections: self.total_connections(),
            max_connections: meta.max_connections,
            traffic_weight: self.traffic_weight(),
            draining: self.is_draining(),
            last_heartbeat: self.last_heartbeat(),
            missed_heartbeats: self.missed(),
            registered_at: self.registered_at,
            last_metrics: meta.last_metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(max: Option<u64>) -> EndpointEntry {
        let mut reg = Registration::new("m1", Protocol::Redis, "127.0.0.1:6379");
        reg.max_connections = max;
        EndpointEntry::new(&reg, DEFAULT_TRAFFIC_WEIGHT, 1_000)
    }

    #[test]
    fn acquire_respects_capacity() {
        let e = entry(Some(2));
        assert!(e.try_acquire());
        assert!(e.try_acquire());
        assert!(!e.try_acquire());
        assert!(e.at_capacity());
        assert_eq!(e.release(), 1);
        assert!(e.try_acquire());
        assert_eq!(e.total_connections(), 3);
    }

    #[test]
    fn release_never_underflows() {
        let e = entry(None);
        assert_eq!(e.release(), 0);
        assert_eq!(e.connections(), 0);
    }

    #[test]
    fn update_clears_draining_and_keeps_counters() {
        let e = entry(None);
        assert!(e.try_acquire());
        e.set_draining();
        e.set_missed(2);

        let reg = Registration::new("m1", Protocol::Redis, "127.0.0.1:6380").with_version("v2");
        e.update(&reg, 5_000);

        assert!(!e.is_draining());
        assert_eq!(e.missed(), 0);
        assert_eq!(e.connections(), 1);
        assert_eq!(e.address(), "127.0.0.1:6380");
        assert_eq!(e.version(), "v2");
        assert_eq!(e.last_heartbeat(), 5_000);
    }

    #[test]
    fn snapshot_reflects_atomics() {
        let e = entry(Some(10));
        e.try_acquire();
        e.set_traffic_weight(25);
        e.set_health(HealthStatus::Degraded);
        let s = e.snapshot();
        assert_eq!(s.current_connections, 1);
        assert_eq!(s.traffic_weight, 25);
        assert_eq!(s.health_status, HealthStatus::Degraded);
        assert_eq!(s.max_connections, Some(10));
    }
}
