//! Protocol-partitioned module registry and connection routing.

use crate::connection::RoutedConnection;
use crate::endpoint::{DEFAULT_TRAFFIC_WEIGHT, EndpointEntry, ModuleEndpoint, Registration};
use crate::error::{RouterError, RouterResult};
use crate::events::{RegistryEvent, RegistryEventKind, RemovalReason};
use nlb_core::{HealthStatus, InstanceId, Protocol, epoch_millis};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub(crate) struct Registry {
    pub by_protocol: HashMap<Protocol, Vec<Arc<EndpointEntry>>>,
    pub index: HashMap<InstanceId, Protocol>,
}

impl Registry {
    pub fn get(&self, instance_id: &str) -> Option<&Arc<EndpointEntry>> {
        let protocol = self.index.get(instance_id)?;
        self.by_protocol
            .get(protocol)?
            .iter()
            .find(|e| e.instance_id == instance_id)
    }
}

pub(crate) struct RouterInner {
    registry: RwLock<Registry>,
    /// Per-protocol `version -> weight` split pushed by the blue/green
    /// controller. Applied to entries as they register.
    version_weights: RwLock<HashMap<Protocol, HashMap<String, u8>>>,
    events: broadcast::Sender<RegistryEvent>,
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
}

impl RouterInner {
    pub fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn emit(&self, kind: RegistryEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(RegistryEvent {
            at: epoch_millis(),
            kind,
        });
    }

    /// Remove `instance_id`. With `expected` set, only that exact entry is
    /// removed, so a stale handle never evicts a newer registration.
    pub fn remove(
        &self,
        instance_id: &str,
        expected: Option<&Arc<EndpointEntry>>,
        reason: RemovalReason,
    ) -> Option<Arc<EndpointEntry>> {
        let removed = {
            let mut registry = self.write();
            let protocol = *registry.index.get(instance_id)?;
            let entries = registry.by_protocol.get_mut(&protocol)?;
            let pos = entries.iter().position(|e| {
                e.instance_id == instance_id && expected.is_none_or(|x| Arc::ptr_eq(x, e))
            })?;
            let entry = entries.remove(pos);
            if entries.is_empty() {
                registry.by_protocol.remove(&protocol);
            }
            registry.index.remove(instance_id);
            entry.mark_removed();
            entry
        };

        info!(
            instance_id,
            protocol = %removed.protocol,
            ?reason,
            "module removed from registry"
        );
        self.emit(RegistryEventKind::Unregistered {
            instance_id: instance_id.to_string(),
            protocol: removed.protocol,
            reason,
        });
        Some(removed)
    }
}

/// Result of a registration call.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    /// Stable across retries: the instance id itself.
    pub registration_id: String,
    /// `false` when an existing registration was updated.
    pub created: bool,
    pub endpoint: ModuleEndpoint,
}

/// Aggregate view of one protocol's pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolStats {
    pub protocol: Protocol,
    pub total_modules: usize,
    pub healthy_modules: usize,
    pub degraded_modules: usize,
    pub unhealthy_modules: usize,
    pub draining_modules: usize,
    pub active_connections: u64,
    pub total_connections: u64,
}

/// Handle to the module registry. Cloning is cheap and every clone sees
/// the same registry.
#[derive(Clone)]
pub struct Router {
    pub(crate) inner: Arc<RouterInner>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_health_policy(Duration::from_secs(15), 3)
    }

    /// Create a router that marks instances unhealthy after
    /// `heartbeat_timeout` of silence and removes them after
    /// `max_missed_heartbeats` such periods.
    pub fn with_health_policy(heartbeat_timeout: Duration, max_missed_heartbeats: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RouterInner {
                registry: RwLock::new(Registry::default()),
                version_weights: RwLock::new(HashMap::new()),
                events,
                heartbeat_timeout,
                max_missed_heartbeats: max_missed_heartbeats.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a module instance. Registering an id that already exists
    /// for the same protocol updates it in place and clears any drain.
    pub fn register_module(&self, reg: Registration) -> RouterResult<RegisterOutcome> {
        self.register_module_at(reg, epoch_millis())
    }

    pub fn register_module_at(
        &self,
        reg: Registration,
        now_ms: u64,
    ) -> RouterResult<RegisterOutcome> {
        validate(&reg)?;
        let weight = self.weight_for(reg.protocol, &reg.version);

        let (entry, created, previous_health) = {
            let mut registry = self.inner.write();
            if let Some(existing) = registry.get(&reg.instance_id) {
                if existing.protocol != reg.protocol {
                    return Err(RouterError::DuplicateRegistration {
                        instance_id: reg.instance_id,
                        existing: existing.protocol,
                    });
                }
                existing.update(&reg, now_ms);
                existing.set_traffic_weight(weight);
                let previous = existing.set_health(HealthStatus::Healthy);
                (existing.clone(), false, Some(previous))
            } else {
                let entry = Arc::new(EndpointEntry::new(&reg, weight, now_ms));
                registry
                    .by_protocol
                    .entry(reg.protocol)
                    .or_default()
                    .push(entry.clone());
                registry
                    .index
                    .insert(reg.instance_id.clone(), reg.protocol);
                (entry, true, None)
            }
        };

        if created {
            info!(
                instance_id = %reg.instance_id,
                protocol = %reg.protocol,
                address = %reg.address,
                version = %reg.version,
                "module registered"
            );
        } else {
            debug!(instance_id = %reg.instance_id, "module re-registered");
        }
        self.inner.emit(RegistryEventKind::Registered {
            instance_id: reg.instance_id.clone(),
            protocol: reg.protocol,
            address: reg.address.clone(),
            version: reg.version.clone(),
        });
        if let Some(from) = previous_health
            && from != HealthStatus::Healthy
        {
            self.inner.emit(RegistryEventKind::HealthChanged {
                instance_id: reg.instance_id.clone(),
                protocol: reg.protocol,
                from,
                to: HealthStatus::Healthy,
            });
        }

        Ok(RegisterOutcome {
            registration_id: reg.instance_id,
            created,
            endpoint: entry.snapshot(),
        })
    }

    /// Remove an instance. A graceful unregister stops new connections
    /// and removes the entry once its last connection is released;
    /// otherwise it is removed immediately. Returns `true` if the entry
    /// is already gone when this call returns.
    pub fn unregister_module(&self, instance_id: &str, graceful: bool) -> RouterResult<bool> {
        let entry = self
            .inner
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| RouterError::UnknownInstance(instance_id.to_string()))?;

        if !graceful {
            self.inner
                .remove(instance_id, Some(&entry), RemovalReason::Unregistered);
            return Ok(true);
        }

        entry.set_draining();
        let previous = entry.set_health(HealthStatus::Stopping);
        if previous != HealthStatus::Stopping {
            self.inner.emit(RegistryEventKind::HealthChanged {
                instance_id: instance_id.to_string(),
                protocol: entry.protocol,
                from: previous,
                to: HealthStatus::Stopping,
            });
        }
        // Checked after the drain flag is set so a concurrent release
        // either sees the flag or leaves zero for us to observe.
        if entry.connections() == 0 {
            self.inner
                .remove(instance_id, Some(&entry), RemovalReason::Drained);
            return Ok(true);
        }
        info!(
            instance_id,
            connections = entry.connections(),
            "module draining"
        );
        Ok(false)
    }

    // ── Routing ────────────────────────────────────────────────────

    /// Pick the least-loaded routable instance for `protocol`.
    pub fn route_connection(&self, protocol: Protocol) -> RouterResult<RoutedConnection> {
        self.route_connection_to_version(protocol, None)
    }

    /// Like [`route_connection`](Self::route_connection), preferring
    /// instances running `version`. Falls back to the whole pool when no
    /// instance of that version can take the connection.
    pub fn route_connection_to_version(
        &self,
        protocol: Protocol,
        version: Option<&str>,
    ) -> RouterResult<RoutedConnection> {
        let picked = match version {
            Some(v) => self
                .select(protocol, Some(v))
                .or_else(|| self.select(protocol, None)),
            None => self.select(protocol, None),
        };
        match picked {
            Some(conn) => {
                debug!(
                    protocol = %protocol,
                    instance_id = %conn.instance_id(),
                    connections = conn.connections(),
                    "connection routed"
                );
                Ok(conn)
            }
            None => Err(RouterError::NoBackendAvailable(protocol)),
        }
    }

    /// Healthy instances first, degraded only when no healthy instance can
    /// take the connection. Within a tier: fewest connections, then lowest
    /// instance id.
    fn select(&self, protocol: Protocol, version: Option<&str>) -> Option<RoutedConnection> {
        let registry = self.inner.read();
        let entries = registry.by_protocol.get(&protocol)?;

        for tier in [HealthStatus::Healthy, HealthStatus::Degraded] {
            let mut candidates: Vec<(u64, &Arc<EndpointEntry>)> = entries
                .iter()
                .filter(|e| e.selectable() && e.health() == tier && !e.at_capacity())
                .filter(|e| version.is_none_or(|v| e.version() == v))
                .map(|e| (e.connections(), e))
                .collect();
            candidates.sort_by(|(ca, a), (cb, b)| {
                ca.cmp(cb).then_with(|| a.instance_id.cmp(&b.instance_id))
            });
            for (_, entry) in candidates {
                if entry.try_acquire() {
                    return Some(RoutedConnection::new(
                        entry.clone(),
                        Arc::downgrade(&self.inner),
                    ));
                }
            }
        }
        None
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_module(&self, instance_id: &str) -> Option<ModuleEndpoint> {
        self.inner.read().get(instance_id).map(|e| e.snapshot())
    }

    /// Snapshot of the registry, optionally limited to one protocol,
    /// ordered by protocol then instance id.
    pub fn list_modules(&self, protocol: Option<Protocol>) -> Vec<ModuleEndpoint> {
        let registry = self.inner.read();
        let mut out: Vec<ModuleEndpoint> = registry
            .by_protocol
            .iter()
            .filter(|(p, _)| protocol.is_none_or(|want| want == **p))
            .flat_map(|(_, entries)| entries.iter().map(|e| e.snapshot()))
            .collect();
        out.sort_by(|a, b| {
            a.protocol
                .cmp(&b.protocol)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instances of `protocol` that are not draining.
    pub fn instance_count(&self, protocol: Protocol) -> u32 {
        self.inner
            .read()
            .by_protocol
            .get(&protocol)
            .map(|entries| entries.iter().filter(|e| !e.is_draining()).count() as u32)
            .unwrap_or(0)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.inner.read().by_protocol.keys().copied().collect();
        protocols.sort();
        protocols
    }

    pub fn stats(&self) -> Vec<ProtocolStats> {
        let registry = self.inner.read();
        let mut out: Vec<ProtocolStats> = registry
            .by_protocol
            .iter()
            .map(|(protocol, entries)| {
                let mut s = ProtocolStats {
                    protocol: *protocol,
                    total_modules: entries.len(),
                    healthy_modules: 0,
                    degraded_modules: 0,
                    unhealthy_modules: 0,
                    draining_modules: 0,
                    active_connections: 0,
                    total_connections: 0,
                };
                for e in entries {
                    if e.is_draining() {
                        s.draining_modules += 1;
                    } else {
                        match e.health() {
                            HealthStatus::Healthy => s.healthy_modules += 1,
                            HealthStatus::Degraded => s.degraded_modules += 1,
                            HealthStatus::Unhealthy => s.unhealthy_modules += 1,
                            HealthStatus::Starting | HealthStatus::Stopping => {}
                        }
                    }
                    s.active_connections += e.connections();
                    s.total_connections += e.total_connections();
                }
                s
            })
            .collect();
        out.sort_by_key(|s| s.protocol);
        out
    }

    // ── Blue/green weights ─────────────────────────────────────────

    /// Apply a per-version traffic split to `protocol`'s instances.
    /// Instances whose version is not listed keep the default weight.
    pub fn set_version_weights(&self, protocol: Protocol, weights: &[(String, u8)]) {
        {
            let mut all = self
                .inner
                .version_weights
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            all.insert(protocol, weights.iter().cloned().collect());
        }
        if let Some(entries) = self.inner.read().by_protocol.get(&protocol) {
            for e in entries {
                e.set_traffic_weight(self.weight_for(protocol, &e.version()));
            }
        }
        debug!(protocol = %protocol, ?weights, "version weights applied");
        self.inner.emit(RegistryEventKind::WeightsChanged {
            protocol,
            weights: weights.to_vec(),
        });
    }

    fn weight_for(&self, protocol: Protocol, version: &str) -> u8 {
        self.inner
            .version_weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .and_then(|w| w.get(version).copied())
            .unwrap_or(DEFAULT_TRAFFIC_WEIGHT)
    }
}

fn validate(reg: &Registration) -> RouterResult<()> {
    if reg.instance_id.trim().is_empty() {
        return Err(RouterError::InvalidRegistration(
            "instance_id must not be empty".to_string(),
        ));
    }
    if reg.address.trim().is_empty() {
        return Err(RouterError::InvalidRegistration(format!(
            "{}: address must not be empty",
            reg.instance_id
        )));
    }
    if reg.max_connections == Some(0) {
        return Err(RouterError::InvalidRegistration(format!(
            "{}: max_connections must be at least 1",
            reg.instance_id
        )));
    }
    Ok(())
}
